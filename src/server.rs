use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes::{health, test_runs};
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health::health))
        // Test runs
        .route(
            "/api/v1/test_runs",
            get(test_runs::list_runs).post(test_runs::create_run),
        )
        .route("/api/v1/test_runs/batch", post(test_runs::create_batch))
        .route("/api/v1/test_runs/{id}", get(test_runs::get_run))
        .route("/api/v1/test_runs/{id}/cancel", patch(test_runs::cancel_run))
        // Results
        .route("/api/v1/test_runs/{id}/results", get(test_runs::list_results))
        .route(
            "/api/v1/test_runs/{id}/results/{request_hash}",
            get(test_runs::get_result),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
