use axum::{
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::Server;
use crate::{alert::AlertmanagerWebhook, metrics};

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAccepted {
    pub status: String,
    pub alerts: usize,
}

#[derive(Debug, Deserialize)]
pub struct RemediationsQuery {
    pub limit: Option<usize>,
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: error.to_string(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "remediator",
    }))
}

/// Alertmanager webhook receiver. Answers as soon as every alert of the
/// batch has been handed to its own pipeline task.
pub async fn webhook(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    let events = match AlertmanagerWebhook::from_slice(&body).and_then(|batch| batch.into_events())
    {
        Ok(events) => events,
        Err(e) => {
            warn!("Rejected webhook payload: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string());
        }
    };

    let count = events.len();
    metrics::ALERTS_RECEIVED_TOTAL.inc_by(count as u64);
    info!(alerts = count, "Accepted alert batch");

    // pipelines outlive the request; their outcome only goes to the audit log
    server.remediator.dispatch(events);

    (
        StatusCode::OK,
        Json(WebhookAccepted {
            status: "accepted".to_string(),
            alerts: count,
        }),
    )
        .into_response()
}

pub async fn remediations(
    State(server): State<Arc<Server>>,
    Query(query): Query<RemediationsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);

    match server.remediator.audit().recent(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!("Failed to read audit records: {}", e);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "audit_unavailable",
                e.to_string(),
            )
        }
    }
}

pub async fn metrics() -> Response {
    match metrics::gather_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics", e.to_string())
        }
    }
}
