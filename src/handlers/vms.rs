//! VM management handlers: desired-state writes plus pool reads.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::PoolError;
use crate::metrics;
use crate::spec::Spec;
use crate::state::AppState;

/// Body of `POST /vms`. The job id falls back to `vm_id`, then `tenant`,
/// then a generated id; the tenant falls back to the job id.
#[derive(Debug, Deserialize)]
pub struct CreateVmRequest {
    pub job_id: Option<String>,
    pub vm_id: Option<String>,
    pub tenant: Option<String>,
    pub spec: Option<Spec>,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    job_id: String,
    status: &'static str,
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "error": message.into() }))
}

/// `POST /vms` — UPSERT the desired entry, then try an immediate attach.
/// 201 when a warm VM satisfied it, 202 when the reconciler has to finish
/// the work on a later tick.
pub async fn create_vm(
    State(state): State<AppState>,
    Json(body): Json<CreateVmRequest>,
) -> Response {
    let Some(spec) = body.spec else {
        return (StatusCode::BAD_REQUEST, error_body("missing spec")).into_response();
    };
    if let Err(reason) = spec.validate() {
        return (StatusCode::BAD_REQUEST, error_body(reason)).into_response();
    }

    let job_id = body
        .job_id
        .or(body.vm_id)
        .or_else(|| body.tenant.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let tenant = body
        .tenant
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| job_id.clone());

    if let Err(e) = state.store().put(&job_id, &tenant, &spec).await {
        tracing::error!(job_id = %job_id, error = %e, "Desired-state write failed");
        return (StatusCode::SERVICE_UNAVAILABLE, error_body(e.to_string())).into_response();
    }

    match state.pool().attach(&job_id, &spec).await {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(PoolError::NoWarmVmAvailable { fingerprint }) => {
            tracing::info!(job_id = %job_id, fingerprint = %fingerprint, "Accepted, waiting for warm VM");
            (
                StatusCode::ACCEPTED,
                Json(AcceptedResponse {
                    job_id,
                    status: "accepted",
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Immediate attach failed");
            (StatusCode::SERVICE_UNAVAILABLE, error_body(e.to_string())).into_response()
        }
    }
}

/// `DELETE /vms/{id}` — remove the desired entry and detach the VM.
pub async fn delete_vm(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    if let Err(e) = state.store().delete(&job_id).await {
        tracing::error!(job_id = %job_id, error = %e, "Desired-state delete failed");
        return (StatusCode::SERVICE_UNAVAILABLE, error_body(e.to_string())).into_response();
    }
    state.pool().detach(&job_id).await;
    StatusCode::NO_CONTENT.into_response()
}

/// `GET /vms/{id}` — live info for one job's VM.
pub async fn get_vm(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.pool().lookup(&job_id).await {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body(format!("no VM for job '{}'", job_id)),
        )
            .into_response(),
    }
}

/// `GET /stats` — pool summary plus per-job and warm-pool detail.
pub async fn stats(State(state): State<AppState>) -> Response {
    let stats = state.pool().stats().await;
    (StatusCode::OK, Json(stats)).into_response()
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics_scrape() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
        .into_response()
}
