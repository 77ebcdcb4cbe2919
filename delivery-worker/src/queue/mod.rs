//! Outbound message queue model.
//!
//! This module provides:
//! - The queue entry, its lifecycle status and the audit record
//! - The exponential backoff policy applied to failed sends
//!
//! ## Lifecycle
//!
//! ```text
//! pending → processing → sent
//!    ↑          │
//!    └──────────┴──→ failed   (operator requeue: failed → pending)
//! ```

pub mod retry;
pub mod types;

pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    AuditRecord, Metadata, NewQueueEntry, QueueEntry, QueueStatus, DEFAULT_MAX_ATTEMPTS,
    META_AB_VARIANT, META_EXPERIMENT_ID,
};
