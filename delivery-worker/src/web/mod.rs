//! HTTP surface of the engine.
//!
//! Routes:
//! - `POST /process-queue`: run one engine cycle (external timer entry point)
//! - `GET /health`
//! - `POST /messages`: queue a direct transactional message
//! - `POST /queue/:id/requeue`: operator requeue of a failed entry
//! - `POST /webhooks/mailgun`: provider delivery events

pub mod handlers;
pub mod signature;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    enqueue_message, health, mailgun_events, process_queue, requeue_entry, AppState,
    EnqueueResponse, ErrorResponse, HealthResponse, MailgunEventPayload,
};
pub use signature::{is_signature_verification_enabled, MailgunSignature, SignatureError};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process-queue", post(process_queue))
        .route("/messages", post(enqueue_message))
        .route("/queue/:id/requeue", post(requeue_entry))
        .route("/webhooks/mailgun", post(mailgun_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
