//! Mailflow - message delivery and automation-scheduling engine.
//!
//! This library provides the engine shared by the two Mailflow binaries:
//! - `mailflow-worker`: self-ticking worker that runs one cycle per interval
//! - `mailflow-web`: HTTP surface driven by an external timer
//!
//! ## Architecture
//!
//! ```text
//! Trigger → Dispatcher (send / backoff) → Retry sweep → Automation Scheduler → Experiment Evaluator
//!               │                                            │
//!               └──→ Provider Adapter              new queue entries
//! ```
//!
//! Every component reads and writes through the [`store`] traits; each owns
//! the status fields of exactly one record type.

pub mod automation;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod experiment;
pub mod provider;
pub mod queue;
pub mod store;
pub mod template;
pub mod web;

// Re-export commonly used types
pub use config::{Config, ProviderKind};
pub use dispatch::{DispatchSummary, Dispatcher};
pub use engine::{CycleReport, Engine, JobKind, JobResult};
pub use error::{ProviderError, StoreError};
pub use queue::{NewQueueEntry, QueueEntry, QueueStatus};
pub use store::{MemoryStore, SqliteStore, Store};
pub use web::AppState;
