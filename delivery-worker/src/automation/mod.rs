//! Automation rules and the scheduler that promotes due executions.
//!
//! Each cycle walks every `pending` execution once:
//!
//! ```text
//! rule missing      → failed   "automation not found"
//! rule inactive     → skipped  "automation inactive"
//! now < execute_at  → untouched, re-checked next cycle
//! template missing  → failed   "template not found"
//! no trigger email  → failed   "recipient missing"
//! otherwise         → completed, one new pending queue entry
//! ```

pub mod types;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use types::{Automation, AutomationExecution, ExecutionOutcome, ExecutionStatus};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::queue::NewQueueEntry;
use crate::store::Store;

/// Metadata key linking a materialized entry back to its execution.
pub const META_EXECUTION_ID: &str = "execution_id";

/// Metadata key carrying the execution's subject (user/event) id.
pub const META_SUBJECT_ID: &str = "subject_id";

/// Counts for one automation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationSummary {
    pub evaluated: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub waiting: usize,
}

pub struct AutomationScheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl AutomationScheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Evaluate every pending execution against its rule's delay.
    ///
    /// Only a store failure aborts the cycle; everything else is recorded on
    /// the execution itself.
    pub async fn run_cycle(&self) -> Result<AutomationSummary, StoreError> {
        let now = self.clock.now();
        let pending = self.store.pending_executions().await?;
        let mut summary = AutomationSummary::default();

        for execution in pending {
            summary.evaluated += 1;

            let Some(automation) = self.store.get_automation(&execution.automation_id).await?
            else {
                let outcome = ExecutionOutcome::Failed("automation not found".to_string());
                if self.close(&execution, outcome).await? {
                    summary.failed += 1;
                }
                continue;
            };

            if !automation.active {
                let outcome = ExecutionOutcome::Skipped("automation inactive".to_string());
                if self.close(&execution, outcome).await? {
                    summary.skipped += 1;
                }
                continue;
            }

            let execute_at = execution.execute_at(&automation);
            if now < execute_at {
                debug!(
                    execution_id = %execution.id,
                    execute_at = %execute_at,
                    "automation_execution_waiting"
                );
                summary.waiting += 1;
                continue;
            }

            let template = match &automation.template_id {
                Some(id) => self.store.get_template(id).await?,
                None => None,
            };
            let Some(template) = template else {
                let outcome = ExecutionOutcome::Failed("template not found".to_string());
                if self.close(&execution, outcome).await? {
                    summary.failed += 1;
                }
                continue;
            };

            let Some(recipient) = execution.recipient() else {
                let outcome = ExecutionOutcome::Failed("recipient missing".to_string());
                if self.close(&execution, outcome).await? {
                    summary.failed += 1;
                }
                continue;
            };

            let (subject, body) = template.render(&execution.trigger_data);
            let mut new_entry = NewQueueEntry::new(recipient, subject, body);
            new_entry.automation_id = Some(automation.id.clone());
            new_entry.template_id = Some(template.id.clone());
            new_entry
                .metadata
                .insert(META_EXECUTION_ID.to_string(), execution.id.clone());
            new_entry
                .metadata
                .insert(META_SUBJECT_ID.to_string(), execution.subject_id.clone());
            let entry = new_entry.into_entry(now);
            let entry_id = entry.id.clone();

            if self
                .store
                .complete_execution(&execution.id, entry, now)
                .await?
            {
                info!(
                    execution_id = %execution.id,
                    automation_id = %automation.id,
                    queue_entry_id = %entry_id,
                    "automation_execution_completed"
                );
                summary.completed += 1;
            } else {
                warn!(execution_id = %execution.id, "automation_execution_already_closed");
            }
        }

        info!(
            evaluated = summary.evaluated,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            waiting = summary.waiting,
            "automation_cycle_complete"
        );

        Ok(summary)
    }

    async fn close(
        &self,
        execution: &AutomationExecution,
        outcome: ExecutionOutcome,
    ) -> Result<bool, StoreError> {
        let closed = self
            .store
            .close_execution(&execution.id, &outcome, self.clock.now())
            .await?;

        if closed {
            info!(
                execution_id = %execution.id,
                automation_id = %execution.automation_id,
                status = %outcome.status(),
                reason = outcome.reason(),
                "automation_execution_closed"
            );
        } else {
            warn!(execution_id = %execution.id, "automation_execution_already_closed");
        }

        Ok(closed)
    }
}
