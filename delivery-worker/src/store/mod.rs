//! Data-access traits and their backends.
//!
//! Each component owns the status fields of exactly one record type, and the
//! traits are cut along the same lines. Every status transition is a
//! conditional update on the expected current status, so two concurrent
//! cycles can never both advance the same record.
//!
//! Backends:
//! - [`MemoryStore`]: process-local, used by tests and zero-config runs
//! - [`SqliteStore`]: persistent, one tokio-rusqlite background connection

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::automation::{Automation, AutomationExecution, ExecutionOutcome};
use crate::error::StoreError;
use crate::experiment::{Counter, ExperimentTest, Variant};
use crate::queue::{AuditRecord, QueueEntry, QueueStatus};
use crate::template::Template;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// How a claimed (`processing`) entry leaves that state.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Delivered. The audit record is appended in the same write.
    Sent {
        provider_message_id: String,
        sent_at: DateTime<Utc>,
        audit: AuditRecord,
    },
    /// Back to `pending`, not eligible before `next_retry_at`.
    Retry {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    /// Permanently failed.
    Failed { attempts: u32, error: String },
}

/// Result of an operator requeue request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    Requeued(QueueEntry),
    NotFound,
    NotFailed(QueueStatus),
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert_entry(&self, entry: QueueEntry) -> Result<(), StoreError>;

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>, StoreError>;

    /// Entries in `status`, or all entries when `None`.
    async fn list_entries(&self, status: Option<QueueStatus>)
        -> Result<Vec<QueueEntry>, StoreError>;

    /// Up to `limit` due `pending` entries, priority descending then schedule ascending.
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<QueueEntry>, StoreError>;

    /// Compare-and-swap `pending → processing`. `false` means someone else won.
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Apply `settlement` if the entry is still `processing`.
    async fn settle(&self, id: &str, settlement: Settlement) -> Result<bool, StoreError>;

    /// `processing` entries whose claim was taken at or before `claimed_before`.
    async fn stranded(&self, claimed_before: DateTime<Utc>)
        -> Result<Vec<QueueEntry>, StoreError>;

    /// Operator action: `failed → pending` with attempts reset.
    async fn requeue_failed(&self, id: &str, now: DateTime<Utc>)
        -> Result<RequeueOutcome, StoreError>;

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError>;
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn upsert_automation(&self, automation: Automation) -> Result<(), StoreError>;

    async fn get_automation(&self, id: &str) -> Result<Option<Automation>, StoreError>;

    async fn insert_execution(&self, execution: AutomationExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<AutomationExecution>, StoreError>;

    async fn pending_executions(&self) -> Result<Vec<AutomationExecution>, StoreError>;

    /// Atomically persist `entry` and move the execution `pending → completed`.
    /// Nothing is written unless the execution was still pending.
    async fn complete_execution(
        &self,
        execution_id: &str,
        entry: QueueEntry,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move the execution `pending → skipped | failed` with a reason.
    async fn close_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn upsert_test(&self, test: ExperimentTest) -> Result<(), StoreError>;

    async fn get_test(&self, id: &str) -> Result<Option<ExperimentTest>, StoreError>;

    async fn running_tests(&self) -> Result<Vec<ExperimentTest>, StoreError>;

    /// Compare-and-swap `running → completed` with the winner.
    async fn complete_test(
        &self,
        id: &str,
        winner: Variant,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Bump one engagement counter of a running test.
    async fn increment(
        &self,
        id: &str,
        variant: Variant,
        counter: Counter,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn upsert_template(&self, template: Template) -> Result<(), StoreError>;

    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError>;
}

/// Recipient-level delivery policy.
#[async_trait]
pub trait SuppressionList: Send + Sync {
    async fn is_suppressed(&self, address: &str) -> Result<bool, StoreError>;

    async fn suppress(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Everything the engine needs from one datastore.
pub trait Store:
    QueueStore + AutomationStore + ExperimentStore + TemplateStore + SuppressionList
{
}

impl<T> Store for T where
    T: QueueStore + AutomationStore + ExperimentStore + TemplateStore + SuppressionList
{
}

/// Canonical form used for suppression lookups.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
