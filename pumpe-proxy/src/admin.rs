//! The management API: list, create, refresh and stop gates, plus the
//! health endpoint. Thin handlers over [`GateAdmin`]; this is the only
//! layer that converts error kinds to HTTP status codes.
//!
//! Every path answers JSON: `{"data": …}` on success, `{"error": "…"}`
//! on failure.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use pumpe_core::{GateError, Kind};

use crate::service::GateAdmin;

#[derive(Serialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Serialize)]
struct ErrEnvelope {
    error: String,
}

#[derive(Deserialize)]
struct CreateRequest {
    kind: Kind,
}

#[derive(Serialize)]
struct CreatedGate {
    id: Uuid,
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    time: DateTime<Utc>,
}

/// The management router, mounted on the proxy's listener.
pub fn router(svc: Arc<GateAdmin>) -> Router {
    Router::new()
        .route("/v1/_service/gates", get(list_gates).post(create_gate))
        .route(
            "/v1/_service/gates/{id}",
            axum::routing::patch(refresh_gate).delete(stop_gate),
        )
        .route("/v1/_internal/status", get(status))
        .with_state(svc)
}

/// The error-kind to status-code mapping of the management API. A client
/// that disconnects mid-operation cancels the work structurally, so no
/// client-closed kind exists to map here.
pub(crate) fn status_for(err: &GateError) -> StatusCode {
    match err {
        GateError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        GateError::KindUnknown => StatusCode::BAD_REQUEST,
        GateError::KindNotSupported => StatusCode::UNPROCESSABLE_ENTITY,
        GateError::SetIsShutting => StatusCode::BAD_GATEWAY,
        GateError::TorMaxReached => StatusCode::CONFLICT,
        GateError::GateNotFound => StatusCode::NOT_FOUND,
        GateError::GateIsRefreshing => StatusCode::CONFLICT,
        GateError::InvalidParam | GateError::InvalidUuid => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond_err(err: &GateError) -> Response {
    (
        status_for(err),
        Json(ErrEnvelope {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn list_gates(State(svc): State<Arc<GateAdmin>>) -> Response {
    match svc.gates() {
        Ok(ids) => {
            info!("fetched gate ids");
            (StatusCode::OK, Json(DataEnvelope { data: ids })).into_response()
        }
        Err(err) => {
            error!(error = %err, "could not fetch gate ids");
            respond_err(&err)
        }
    }
}

async fn create_gate(State(svc): State<Arc<GateAdmin>>, body: Bytes) -> Response {
    let req: CreateRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            error!(error = %err, "failed to parse create request");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrEnvelope {
                    error: err.to_string(),
                }),
            )
                .into_response();
        }
    };

    match svc.create(req.kind).await {
        Ok(id) => {
            info!(gate.kind = %req.kind, gate.id = %id, "created new gate");
            (
                StatusCode::CREATED,
                Json(DataEnvelope {
                    data: CreatedGate { id },
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "could not create new gate");
            respond_err(&err)
        }
    }
}

async fn refresh_gate(State(svc): State<Arc<GateAdmin>>, Path(id): Path<String>) -> Response {
    let id = match parse_gate_id(&id) {
        Ok(id) => id,
        Err(err) => {
            error!(error = %err, param = %id, "invalid gate id");
            return respond_err(&err);
        }
    };

    match svc.refresh(id).await {
        Ok(()) => {
            info!(gate.id = %id, "refreshed gate");
            (StatusCode::OK, Json(serde_json::json!({}))).into_response()
        }
        Err(err) => {
            error!(gate.id = %id, error = %err, "could not refresh gate");
            respond_err(&err)
        }
    }
}

async fn stop_gate(State(svc): State<Arc<GateAdmin>>, Path(id): Path<String>) -> Response {
    let id = match parse_gate_id(&id) {
        Ok(id) => id,
        Err(err) => {
            error!(error = %err, param = %id, "invalid gate id");
            return respond_err(&err);
        }
    };

    match svc.stop(id).await {
        Ok(()) => {
            info!(gate.id = %id, "stopped gate");
            (StatusCode::OK, Json(serde_json::json!({}))).into_response()
        }
        Err(err) => {
            error!(gate.id = %id, error = %err, "could not stop gate");
            respond_err(&err)
        }
    }
}

async fn status() -> Response {
    (
        StatusCode::OK,
        Json(DataEnvelope {
            data: HealthStatus {
                status: "ok",
                time: Utc::now(),
            },
        }),
    )
        .into_response()
}

fn parse_gate_id(raw: &str) -> Result<Uuid, GateError> {
    if raw.is_empty() {
        return Err(GateError::InvalidParam);
    }

    Uuid::parse_str(raw).map_err(|_| GateError::InvalidUuid)
}
