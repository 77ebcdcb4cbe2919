//! HTTP endpoint handlers.
//!
//! The process endpoint is the external Scheduling Trigger's entry point:
//! one call runs one engine cycle and returns its report.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::events::{apply_event, EventEffect, MailgunEventData};
use crate::queue::NewQueueEntry;
use crate::store::RequeueOutcome;
use crate::web::signature::{bearer_matches, is_signature_verification_enabled, MailgunSignature};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(config: Config, engine: Engine) -> Self {
        Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
        }
    }
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Cycle Trigger
// =============================================================================

/// Run one engine cycle.
///
/// When `CRON_SECRET` is set the caller must present it as a bearer token.
/// Answers 200 with the report when every job succeeded, 500 otherwise.
pub async fn process_queue(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.config.cron_secret {
        let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        if !bearer_matches(header, secret) {
            warn!(has_header = header.is_some(), "process_queue_unauthorized");
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let report = state.engine.run_cycle().await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(report)).into_response()
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: String,
}

/// Queue a direct transactional message.
pub async fn enqueue_message(
    State(state): State<AppState>,
    Json(new_entry): Json<NewQueueEntry>,
) -> Response {
    if let Err(reason) = new_entry.validate() {
        warn!(reason = %reason, "enqueue_rejected");
        return error_response(StatusCode::BAD_REQUEST, reason);
    }

    match state.engine.enqueue(new_entry).await {
        Ok(entry) => (StatusCode::ACCEPTED, Json(EnqueueResponse { id: entry.id })).into_response(),
        Err(e) => {
            error!(error = %e, "enqueue_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Operator requeue of a permanently failed entry.
pub async fn requeue_entry(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.dispatcher().requeue_failed(&id).await {
        Ok(RequeueOutcome::Requeued(entry)) => (StatusCode::OK, Json(entry)).into_response(),
        Ok(RequeueOutcome::NotFound) => error_response(StatusCode::NOT_FOUND, "entry not found"),
        Ok(RequeueOutcome::NotFailed(status)) => error_response(
            StatusCode::CONFLICT,
            format!("entry is {status}, only failed entries can be requeued"),
        ),
        Err(e) => {
            error!(queue_entry_id = %id, error = %e, "requeue_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// =============================================================================
// Mailgun Events
// =============================================================================

/// Mailgun event webhook body (JSON, not form-encoded).
#[derive(Debug, Deserialize)]
pub struct MailgunEventPayload {
    #[serde(default)]
    pub signature: MailgunSignature,
    #[serde(rename = "event-data")]
    pub event_data: MailgunEventData,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub status: &'static str,
    pub effect: EventEffect,
}

/// Delivery event webhook: bounces and complaints suppress, opens and clicks
/// count toward running experiments.
pub async fn mailgun_events(
    State(state): State<AppState>,
    Json(payload): Json<MailgunEventPayload>,
) -> Response {
    let event_data = &payload.event_data;
    info!(
        event = %event_data.event,
        recipient = %event_data.recipient,
        has_signature = !payload.signature.signature.is_empty(),
        "mailgun_event_received"
    );

    if is_signature_verification_enabled(&state.config.mailgun_signing_key) {
        let signing_key = state.config.mailgun_signing_key.as_deref().unwrap_or_default();
        let now = state.engine.clock().now().timestamp();
        if let Err(e) = payload.signature.verify(
            signing_key,
            state.config.mailgun_signature_max_age,
            now,
        ) {
            warn!(event = %event_data.event, reason = %e, "mailgun_signature_invalid");
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let event = event_data.classify();
    let now = state.engine.clock().now();
    match apply_event(state.engine.store().as_ref(), &event, now).await {
        Ok(effect) => (
            StatusCode::OK,
            Json(EventResponse {
                status: "ok",
                effect,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(event = %event_data.event, error = %e, "mailgun_event_store_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
