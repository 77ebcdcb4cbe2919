//! In-memory store backend.
//!
//! One mutex guards all tables, so each trait method is a single critical
//! section and the conditional transitions are trivially atomic. The lock is
//! never held across an await.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    normalize_address, AutomationStore, ExperimentStore, QueueStore, RequeueOutcome, Settlement,
    SuppressionList, TemplateStore,
};
use crate::automation::{Automation, AutomationExecution, ExecutionOutcome, ExecutionStatus};
use crate::error::StoreError;
use crate::experiment::{Counter, ExperimentStatus, ExperimentTest, Variant};
use crate::queue::{AuditRecord, QueueEntry, QueueStatus};
use crate::template::Template;

#[derive(Default)]
struct Tables {
    entries: HashMap<String, QueueEntry>,
    audit: Vec<AuditRecord>,
    automations: HashMap<String, Automation>,
    executions: HashMap<String, AutomationExecution>,
    tests: HashMap<String, ExperimentTest>,
    templates: HashMap<String, Template>,
    suppressions: HashMap<String, (String, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_entry(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.tables.lock().entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.tables.lock().entries.get(id).cloned())
    }

    async fn list_entries(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let tables = self.tables.lock();
        let mut entries: Vec<QueueEntry> = tables
            .entries
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let tables = self.tables.lock();
        let mut due: Vec<QueueEntry> = tables
            .entries
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(QueueEntry::dispatch_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.entries.get_mut(id) {
            Some(entry) if entry.status == QueueStatus::Pending => {
                entry.status = QueueStatus::Processing;
                entry.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle(&self, id: &str, settlement: Settlement) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let Some(entry) = tables.entries.get_mut(id) else {
            return Ok(false);
        };
        if entry.status != QueueStatus::Processing {
            return Ok(false);
        }

        entry.claimed_at = None;
        match settlement {
            Settlement::Sent {
                provider_message_id,
                sent_at,
                audit,
            } => {
                entry.status = QueueStatus::Sent;
                entry.provider_message_id = Some(provider_message_id);
                entry.sent_at = Some(sent_at);
                entry.next_retry_at = None;
                entry.error_message = None;
                tables.audit.push(audit);
            }
            Settlement::Retry {
                attempts,
                next_retry_at,
                error,
            } => {
                entry.status = QueueStatus::Pending;
                entry.attempts = attempts;
                entry.next_retry_at = Some(next_retry_at);
                entry.error_message = Some(error);
            }
            Settlement::Failed { attempts, error } => {
                entry.status = QueueStatus::Failed;
                entry.attempts = attempts;
                entry.next_retry_at = None;
                entry.error_message = Some(error);
            }
        }
        Ok(true)
    }

    async fn stranded(&self, claimed_before: DateTime<Utc>) -> Result<Vec<QueueEntry>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .entries
            .values()
            .filter(|e| {
                e.status == QueueStatus::Processing
                    && e.claimed_at.map_or(true, |at| at <= claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn requeue_failed(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, StoreError> {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.entries.get_mut(id) else {
            return Ok(RequeueOutcome::NotFound);
        };
        if entry.status != QueueStatus::Failed {
            return Ok(RequeueOutcome::NotFailed(entry.status));
        }

        entry.status = QueueStatus::Pending;
        entry.attempts = 0;
        entry.next_retry_at = None;
        entry.error_message = None;
        entry.scheduled_at = entry.scheduled_at.min(now);
        Ok(RequeueOutcome::Requeued(entry.clone()))
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self.tables.lock().audit.clone())
    }
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn upsert_automation(&self, automation: Automation) -> Result<(), StoreError> {
        self.tables
            .lock()
            .automations
            .insert(automation.id.clone(), automation);
        Ok(())
    }

    async fn get_automation(&self, id: &str) -> Result<Option<Automation>, StoreError> {
        Ok(self.tables.lock().automations.get(id).cloned())
    }

    async fn insert_execution(&self, execution: AutomationExecution) -> Result<(), StoreError> {
        self.tables
            .lock()
            .executions
            .insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<AutomationExecution>, StoreError> {
        Ok(self.tables.lock().executions.get(id).cloned())
    }

    async fn pending_executions(&self) -> Result<Vec<AutomationExecution>, StoreError> {
        let tables = self.tables.lock();
        let mut pending: Vec<AutomationExecution> = tables
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        entry: QueueEntry,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let Some(execution) = tables.executions.get_mut(execution_id) else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Pending {
            return Ok(false);
        }

        execution.status = ExecutionStatus::Completed;
        execution.executed_at = Some(at);
        execution.queue_entry_id = Some(entry.id.clone());
        tables.entries.insert(entry.id.clone(), entry);
        Ok(true)
    }

    async fn close_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.executions.get_mut(execution_id) {
            Some(execution) if execution.status == ExecutionStatus::Pending => {
                execution.status = outcome.status();
                execution.executed_at = Some(at);
                execution.skip_reason = Some(outcome.reason().to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn upsert_test(&self, test: ExperimentTest) -> Result<(), StoreError> {
        self.tables.lock().tests.insert(test.id.clone(), test);
        Ok(())
    }

    async fn get_test(&self, id: &str) -> Result<Option<ExperimentTest>, StoreError> {
        Ok(self.tables.lock().tests.get(id).cloned())
    }

    async fn running_tests(&self) -> Result<Vec<ExperimentTest>, StoreError> {
        let tables = self.tables.lock();
        let mut running: Vec<ExperimentTest> = tables
            .tests
            .values()
            .filter(|t| t.status == ExperimentStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(running)
    }

    async fn complete_test(
        &self,
        id: &str,
        winner: Variant,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.tests.get_mut(id) {
            Some(test) if test.status == ExperimentStatus::Running => {
                test.status = ExperimentStatus::Completed;
                test.winner = Some(winner);
                test.completed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(
        &self,
        id: &str,
        variant: Variant,
        counter: Counter,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.tests.get_mut(id) {
            Some(test) if test.status == ExperimentStatus::Running => {
                let stats = test.stats_mut(variant);
                match counter {
                    Counter::Sent => stats.sent += 1,
                    Counter::Opens => stats.opens += 1,
                    Counter::Clicks => stats.clicks += 1,
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn upsert_template(&self, template: Template) -> Result<(), StoreError> {
        self.tables
            .lock()
            .templates
            .insert(template.id.clone(), template);
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.tables.lock().templates.get(id).cloned())
    }
}

#[async_trait]
impl SuppressionList for MemoryStore {
    async fn is_suppressed(&self, address: &str) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .lock()
            .suppressions
            .contains_key(&normalize_address(address)))
    }

    async fn suppress(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables
            .lock()
            .suppressions
            .insert(normalize_address(address), (reason.to_string(), at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::experiment::WinnerCriteria;
    use crate::queue::NewQueueEntry;

    fn entry(now: DateTime<Utc>, subject: &str, priority: i32) -> QueueEntry {
        let mut new = NewQueueEntry::new("ada@example.com", subject, "<p>hi</p>");
        new.priority = priority;
        new.into_entry(now)
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_swap() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let e = entry(now, "one", 0);
        let id = e.id.clone();
        store.insert_entry(e).await.unwrap();

        assert!(store.claim(&id, now).await.unwrap());
        assert!(!store.claim(&id, now).await.unwrap());

        let claimed = store.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.claimed_at, Some(now));
    }

    #[tokio::test]
    async fn test_fetch_due_orders_and_limits() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_entry(entry(now, "low", 0)).await.unwrap();
        store.insert_entry(entry(now, "high", 9)).await.unwrap();
        let mut future = entry(now, "future", 10);
        future.scheduled_at = now + Duration::hours(1);
        store.insert_entry(future).await.unwrap();

        let due = store.fetch_due(now, 10).await.unwrap();
        let subjects: Vec<_> = due.iter().map(|e| e.subject.as_str()).collect();
        assert_eq!(subjects, vec!["high", "low"]);

        let limited = store.fetch_due(now, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].subject, "high");
    }

    #[tokio::test]
    async fn test_settle_requires_processing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let e = entry(now, "one", 0);
        let id = e.id.clone();
        let audit = AuditRecord::for_sent(&e, "prov-1", now);
        store.insert_entry(e).await.unwrap();

        let sent = Settlement::Sent {
            provider_message_id: "prov-1".to_string(),
            sent_at: now,
            audit,
        };
        // Not claimed yet
        assert!(!store.settle(&id, sent.clone()).await.unwrap());

        store.claim(&id, now).await.unwrap();
        assert!(store.settle(&id, sent.clone()).await.unwrap());
        // Terminal: second settle is a no-op and appends no audit record
        assert!(!store.settle(&id, sent).await.unwrap());
        assert_eq!(store.audit_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_failed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let e = entry(now, "one", 0);
        let id = e.id.clone();
        store.insert_entry(e).await.unwrap();

        assert_eq!(
            store.requeue_failed(&id, now).await.unwrap(),
            RequeueOutcome::NotFailed(QueueStatus::Pending)
        );
        assert_eq!(
            store.requeue_failed("missing", now).await.unwrap(),
            RequeueOutcome::NotFound
        );

        store.claim(&id, now).await.unwrap();
        store
            .settle(
                &id,
                Settlement::Failed {
                    attempts: 3,
                    error: "boom".to_string(),
                },
            )
            .await
            .unwrap();

        match store.requeue_failed(&id, now).await.unwrap() {
            RequeueOutcome::Requeued(entry) => {
                assert_eq!(entry.status, QueueStatus::Pending);
                assert_eq!(entry.attempts, 0);
                assert!(entry.error_message.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_execution_is_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let execution = AutomationExecution::new("auto", "user", json!({}), now);
        let exec_id = execution.id.clone();
        store.insert_execution(execution).await.unwrap();

        let first = entry(now, "first", 0);
        let first_id = first.id.clone();
        assert!(store.complete_execution(&exec_id, first, now).await.unwrap());
        assert!(!store
            .complete_execution(&exec_id, entry(now, "second", 0), now)
            .await
            .unwrap());

        let done = store.get_execution(&exec_id).await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.queue_entry_id.as_deref(), Some(first_id.as_str()));
        assert_eq!(store.list_entries(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_increment_only_running() {
        let store = MemoryStore::new();
        let test = ExperimentTest::new("t1", Utc::now(), 1.0, WinnerCriteria::OpenRate);
        store.upsert_test(test).await.unwrap();

        let completed_at = Utc::now();
        assert!(store.increment("t1", Variant::B, Counter::Opens).await.unwrap());
        assert!(store.complete_test("t1", Variant::B, completed_at).await.unwrap());
        assert!(!store.increment("t1", Variant::B, Counter::Opens).await.unwrap());
        assert!(!store.complete_test("t1", Variant::A, Utc::now()).await.unwrap());

        let test = store.get_test("t1").await.unwrap().unwrap();
        assert_eq!(test.variant_b.opens, 1);
        assert_eq!(test.winner, Some(Variant::B));
        assert_eq!(test.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn test_suppression_is_case_insensitive() {
        let store = MemoryStore::new();
        store
            .suppress("Ada@Example.com", "bounced", Utc::now())
            .await
            .unwrap();
        assert!(store.is_suppressed("ada@example.com").await.unwrap());
        assert!(!store.is_suppressed("bob@example.com").await.unwrap());
    }
}
