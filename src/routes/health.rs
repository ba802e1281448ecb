use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: DatabaseHealth,
    pub workers: WorkerInfo,
    pub service: ServiceInfo,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    pub reachable: bool,
    pub path: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct WorkerInfo {
    pub count: usize,
    pub consumers_per_run: usize,
    pub polling: bool,
    pub dry_run: bool,
}

#[derive(Serialize)]
pub struct ServiceInfo {
    pub version: String,
    pub started_at: String,
    pub shutting_down: bool,
}

/// Overall status from storage reachability and shutdown progress.
pub fn determine_overall_status(database_reachable: bool, shutting_down: bool) -> &'static str {
    if shutting_down {
        "stopping"
    } else if database_reachable {
        "healthy"
    } else {
        "degraded"
    }
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(build_health_response(&state))
}

pub fn build_health_response(state: &SharedState) -> HealthResponse {
    let ping = state.db.ping();
    let shutting_down = state.is_shutting_down();
    let config = &state.config;

    HealthResponse {
        status: determine_overall_status(ping.is_ok(), shutting_down).to_string(),
        database: DatabaseHealth {
            reachable: ping.is_ok(),
            path: state.db.path().map(|p| p.display().to_string()),
            error: ping.err().map(|e| format!("{:#}", e)),
        },
        workers: WorkerInfo {
            count: config.worker_count,
            consumers_per_run: config.consumer_count,
            polling: config.polling,
            dry_run: config.dry_run,
        },
        service: ServiceInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: state.started_at.to_rfc3339(),
            shutting_down,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        assert_eq!(determine_overall_status(true, false), "healthy");
        assert_eq!(determine_overall_status(false, false), "degraded");
        assert_eq!(determine_overall_status(true, true), "stopping");
    }
}
