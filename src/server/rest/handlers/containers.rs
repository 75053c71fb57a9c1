use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::executor::Executor;
use crate::models::{Container, ContainerSpec, Tags};
use crate::server::rest::error::{ApiError, ApiResult};

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct AllocationResponse {
    /// Guid to reason, for every spec that was not allocated.
    pub failed: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub path: String,
}

pub async fn allocate_containers(
    State(executor): State<Executor>,
    Json(specs): Json<Vec<ContainerSpec>>,
) -> ApiResult<Json<AllocationResponse>> {
    let failed = executor
        .allocate_containers(specs)
        .await
        .into_iter()
        .map(|(guid, err)| (guid, err.to_string()))
        .collect();

    Ok(Json(AllocationResponse { failed }))
}

pub async fn list_containers(
    State(executor): State<Executor>,
    Query(tags): Query<Tags>,
) -> ApiResult<Json<Vec<Container>>> {
    Ok(Json(executor.list_containers(&tags).await))
}

pub async fn get_container(
    State(executor): State<Executor>,
    Path(guid): Path<String>,
) -> ApiResult<Json<Container>> {
    Ok(Json(executor.get_container(&guid).await?))
}

pub async fn run_container(
    State(executor): State<Executor>,
    Path(guid): Path<String>,
) -> ApiResult<StatusCode> {
    executor.run_container(&guid).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop_container(
    State(executor): State<Executor>,
    Path(guid): Path<String>,
) -> ApiResult<StatusCode> {
    executor.stop_container(&guid).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_container(
    State(executor): State<Executor>,
    Path(guid): Path<String>,
) -> ApiResult<StatusCode> {
    executor.delete_container(&guid).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_files(
    State(executor): State<Executor>,
    Path(guid): Path<String>,
    Query(query): Query<FilesQuery>,
) -> ApiResult<Response> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("path is required".to_string()));
    }

    let stream = executor.get_files(&guid, &query.path).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-tar")],
        Body::from_stream(stream),
    )
        .into_response())
}
