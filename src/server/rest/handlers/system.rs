use axum::{extract::State, http::StatusCode, Json};

use crate::executor::Executor;
use crate::models::ExecutorResources;
use crate::server::rest::error::{ApiError, ApiResult};

pub async fn ping(State(executor): State<Executor>) -> ApiResult<StatusCode> {
    executor
        .ping()
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;
    Ok(StatusCode::OK)
}

pub async fn remaining_resources(State(executor): State<Executor>) -> Json<ExecutorResources> {
    Json(executor.remaining_resources().await)
}

pub async fn total_resources(State(executor): State<Executor>) -> Json<ExecutorResources> {
    Json(executor.total_resources().await)
}
