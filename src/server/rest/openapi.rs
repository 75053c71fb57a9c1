use utoipa::OpenApi;

use crate::models::{
    Container, ContainerSpec, ContainerState, EnvironmentVariable, ExecutorResources, PortMapping,
    RunResult,
};
use crate::server::rest::{
    error::{ErrorDetails, ErrorResponse},
    handlers::containers::AllocationResponse,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::rest::openapi::ping,
        crate::server::rest::openapi::version,
        crate::server::rest::openapi::total_resources,
        crate::server::rest::openapi::remaining_resources,
        crate::server::rest::openapi::allocate_containers,
        crate::server::rest::openapi::list_containers,
        crate::server::rest::openapi::get_container,
        crate::server::rest::openapi::run_container,
        crate::server::rest::openapi::stop_container,
        crate::server::rest::openapi::delete_container,
        crate::server::rest::openapi::get_files,
        crate::server::rest::openapi::subscribe_to_events,
    ),
    components(
        schemas(
            Container,
            ContainerSpec,
            ContainerState,
            RunResult,
            EnvironmentVariable,
            PortMapping,
            ExecutorResources,
            AllocationResponse,
            ErrorResponse,
            ErrorDetails,
        )
    ),
    tags(
        (name = "System", description = "Liveness and capacity"),
        (name = "Containers", description = "Container lifecycle"),
        (name = "Events", description = "Container event stream"),
    ),
    info(
        title = "cellexec REST API",
        version = "0.1.0",
        description = "Node-local executor for sandboxed containers",
        license(name = "MIT"),
    ),
    servers(
        (url = "/", description = "Current server"),
    ),
)]
pub struct ApiDoc;

#[utoipa::path(
    get,
    path = "/api/v0/ping",
    tag = "System",
    responses(
        (status = 200, description = "Sandbox runtime reachable"),
        (status = 502, description = "Sandbox runtime unreachable", body = ErrorResponse),
    ),
)]
#[allow(dead_code)]
pub async fn ping() {}

#[utoipa::path(
    get,
    path = "/api/v0/version",
    tag = "System",
    responses(
        (status = 200, description = "API version", body = String),
    ),
)]
#[allow(dead_code)]
pub async fn version() {}

#[utoipa::path(
    get,
    path = "/api/v0/resources/total",
    tag = "System",
    responses(
        (status = 200, description = "Total capacity", body = ExecutorResources),
    ),
)]
#[allow(dead_code)]
pub async fn total_resources() {}

#[utoipa::path(
    get,
    path = "/api/v0/resources/remaining",
    tag = "System",
    responses(
        (status = 200, description = "Unreserved capacity", body = ExecutorResources),
    ),
)]
#[allow(dead_code)]
pub async fn remaining_resources() {}

#[utoipa::path(
    post,
    path = "/api/v0/containers",
    tag = "Containers",
    request_body = Vec<ContainerSpec>,
    responses(
        (status = 200, description = "Allocation outcome; guids absent from `failed` are reserved", body = AllocationResponse),
    ),
)]
#[allow(dead_code)]
pub async fn allocate_containers() {}

#[utoipa::path(
    get,
    path = "/api/v0/containers",
    tag = "Containers",
    params(
        ("tag" = Option<String>, Query, description = "Any key=value query pair filters by tag; every pair must match"),
    ),
    responses(
        (status = 200, description = "Matching containers", body = Vec<Container>),
    ),
)]
#[allow(dead_code)]
pub async fn list_containers() {}

#[utoipa::path(
    get,
    path = "/api/v0/containers/{guid}",
    tag = "Containers",
    params(("guid" = String, Path, description = "Container guid")),
    responses(
        (status = 200, description = "Container", body = Container),
        (status = 404, description = "Container not found", body = ErrorResponse),
    ),
)]
#[allow(dead_code)]
pub async fn get_container() {}

#[utoipa::path(
    post,
    path = "/api/v0/containers/{guid}/run",
    tag = "Containers",
    params(("guid" = String, Path, description = "Container guid")),
    responses(
        (status = 202, description = "Container is initializing"),
        (status = 404, description = "Container not found", body = ErrorResponse),
        (status = 409, description = "Container is not reserved", body = ErrorResponse),
        (status = 503, description = "Executor is shutting down", body = ErrorResponse),
    ),
)]
#[allow(dead_code)]
pub async fn run_container() {}

#[utoipa::path(
    post,
    path = "/api/v0/containers/{guid}/stop",
    tag = "Containers",
    params(("guid" = String, Path, description = "Container guid")),
    responses(
        (status = 204, description = "Container stopped"),
        (status = 404, description = "Container not found", body = ErrorResponse),
    ),
)]
#[allow(dead_code)]
pub async fn stop_container() {}

#[utoipa::path(
    delete,
    path = "/api/v0/containers/{guid}",
    tag = "Containers",
    params(("guid" = String, Path, description = "Container guid")),
    responses(
        (status = 204, description = "Container deleted"),
        (status = 404, description = "Container not found", body = ErrorResponse),
    ),
)]
#[allow(dead_code)]
pub async fn delete_container() {}

#[utoipa::path(
    get,
    path = "/api/v0/containers/{guid}/files",
    tag = "Containers",
    params(
        ("guid" = String, Path, description = "Container guid"),
        ("path" = String, Query, description = "File or directory inside the sandbox"),
    ),
    responses(
        (status = 200, description = "Tar archive", content_type = "application/x-tar"),
        (status = 404, description = "Container not found", body = ErrorResponse),
        (status = 409, description = "Container not initialized yet", body = ErrorResponse),
    ),
)]
#[allow(dead_code)]
pub async fn get_files() {}

#[utoipa::path(
    get,
    path = "/api/v0/events",
    tag = "Events",
    responses(
        (status = 200, description = "Server-sent event stream of container transitions", content_type = "text/event-stream"),
    ),
)]
#[allow(dead_code)]
pub async fn subscribe_to_events() {}
