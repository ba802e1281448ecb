use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::config::RUN_UPDATE_MAX_RETRIES;
use crate::error::MutatorError;
use crate::results::ResultFilter;
use crate::state::SharedState;
use crate::test_run::{Endpoint, NewTestRun, RunFilter, TestRun};

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Deserialize, Default)]
pub struct BatchCommon {
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub common: Option<BatchCommon>,
    pub endpoints: Vec<CreateRunRequest>,
}

/// Method must be an HTTP token, url an absolute http(s) URL with a host.
pub fn validate_endpoint(endpoint: &Endpoint) -> Result<(), MutatorError> {
    if endpoint.method.is_empty() || Method::from_bytes(endpoint.method.as_bytes()).is_err() {
        return Err(MutatorError::BadRequest(format!(
            "invalid HTTP method {:?}",
            endpoint.method
        )));
    }
    let url = url::Url::parse(&endpoint.url)
        .map_err(|e| MutatorError::BadRequest(format!("invalid url {:?}: {}", endpoint.url, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(MutatorError::BadRequest(format!(
            "url {:?} must be an absolute http(s) URL",
            endpoint.url
        )));
    }
    Ok(())
}

/// Lays the batch's common headers and config over one entry. Common values
/// win on key collisions.
pub fn apply_common(mut request: CreateRunRequest, common: &BatchCommon) -> CreateRunRequest {
    if let Some(headers) = &common.headers {
        let merged = request.endpoint.headers.get_or_insert_with(BTreeMap::new);
        merged.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(Value::Object(common_config)) = &common.config {
        let mut merged = match request.config.take() {
            Some(Value::Object(own)) => own,
            _ => Map::new(),
        };
        for (key, value) in common_config {
            merged.insert(key.clone(), value.clone());
        }
        request.config = Some(Value::Object(merged));
    }
    request
}

fn store_run(
    state: &SharedState,
    request: CreateRunRequest,
    batch_id: Option<String>,
) -> Result<TestRun, MutatorError> {
    validate_endpoint(&request.endpoint)?;
    let id = state.db.insert_run(&NewTestRun {
        endpoint: request.endpoint,
        config: request.config,
        batch_id,
    })?;
    state.notify_run(id);
    state.db.get_run(id)?.ok_or(MutatorError::RunNotFound(id))
}

pub async fn create_run(
    State(state): State<SharedState>,
    Json(body): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, MutatorError> {
    let run = store_run(&state, body, None)?;
    info!(
        "Created test run {} for {} {}",
        run.id, run.endpoint.method, run.endpoint.url
    );
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn create_batch(
    State(state): State<SharedState>,
    Json(body): Json<BatchRequest>,
) -> Result<impl IntoResponse, MutatorError> {
    if body.endpoints.is_empty() {
        return Err(MutatorError::BadRequest("batch has no endpoints".to_string()));
    }
    let common = body.common.unwrap_or_default();
    let requests: Vec<CreateRunRequest> = body
        .endpoints
        .into_iter()
        .map(|request| apply_common(request, &common))
        .collect();
    // Reject the whole batch before storing any of it.
    for request in &requests {
        validate_endpoint(&request.endpoint)?;
    }

    let batch_id = Uuid::new_v4().to_string();
    let mut runs = Vec::with_capacity(requests.len());
    for request in requests {
        runs.push(store_run(&state, request, Some(batch_id.clone()))?);
    }
    info!("Created batch {} with {} test runs", batch_id, runs.len());
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "batch_id": batch_id,
            "test_runs": runs,
        })),
    ))
}

pub async fn list_runs(
    State(state): State<SharedState>,
    Query(filter): Query<RunFilter>,
) -> Result<Json<Vec<TestRun>>, MutatorError> {
    Ok(Json(state.db.list_runs(&filter)?))
}

pub async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<TestRun>, MutatorError> {
    state
        .db
        .get_run(id)?
        .map(Json)
        .ok_or(MutatorError::RunNotFound(id))
}

pub async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<TestRun>, MutatorError> {
    let run = state.db.get_run(id)?.ok_or(MutatorError::RunNotFound(id))?;
    if !run.state.is_claimable() || !state.db.cancel_run(id, RUN_UPDATE_MAX_RETRIES)? {
        let current = state.db.get_run(id)?.map(|r| r.state).unwrap_or(run.state);
        return Err(MutatorError::InvalidState {
            id,
            state: current.to_string(),
            reason: "only pending, generating or running test runs can be cancelled".to_string(),
        });
    }
    info!("Test run {} cancelled through intake", id);
    state
        .db
        .get_run(id)?
        .map(Json)
        .ok_or(MutatorError::RunNotFound(id))
}

pub async fn list_results(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(filter): Query<ResultFilter>,
) -> Result<impl IntoResponse, MutatorError> {
    state.db.get_run(id)?.ok_or(MutatorError::RunNotFound(id))?;
    Ok(Json(state.db.list_results(id, &filter)?))
}

pub async fn get_result(
    State(state): State<SharedState>,
    Path((id, request_hash)): Path<(i64, String)>,
) -> Result<impl IntoResponse, MutatorError> {
    state.db.get_run(id)?.ok_or(MutatorError::RunNotFound(id))?;
    let results = state.db.get_results_by_hash(id, &request_hash)?;
    if results.is_empty() {
        return Err(MutatorError::ResultNotFound {
            run_id: id,
            request_hash,
        });
    }
    Ok(Json(results))
}
