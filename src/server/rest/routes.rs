use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::executor::Executor;
use crate::server::rest::{handlers, logging_middleware::request_logging_middleware, openapi::ApiDoc};

pub fn create_router(executor: Executor) -> Router {
    let api_routes = Router::new()
        .route("/ping", get(handlers::system::ping))
        .route("/version", get(version))
        // Resource endpoints
        .route("/resources/total", get(handlers::system::total_resources))
        .route("/resources/remaining", get(handlers::system::remaining_resources))
        // Container endpoints
        .route(
            "/containers",
            get(handlers::containers::list_containers).post(handlers::containers::allocate_containers),
        )
        .route(
            "/containers/{guid}",
            get(handlers::containers::get_container).delete(handlers::containers::delete_container),
        )
        .route("/containers/{guid}/run", post(handlers::containers::run_container))
        .route("/containers/{guid}/stop", post(handlers::containers::stop_container))
        .route("/containers/{guid}/files", get(handlers::containers::get_files))
        // Event stream
        .route("/events", get(handlers::events::subscribe_to_events))
        .with_state(executor);

    Router::new()
        .nest("/api/v0", api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn version() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "v0"
    }))
}
