#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use mailflow::automation::{Automation, AutomationExecution, ExecutionOutcome};
use mailflow::clock::ManualClock;
use mailflow::experiment::{Counter, ExperimentTest, Variant};
use mailflow::provider::{OutboundMessage, Provider};
use mailflow::queue::AuditRecord;
use mailflow::store::{
    AutomationStore, ExperimentStore, QueueStore, RequeueOutcome, Settlement, SuppressionList,
    TemplateStore,
};
use mailflow::template::Template;
use mailflow::{Config, Engine, MemoryStore, ProviderError, QueueEntry, QueueStatus, StoreError};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Provider that plays back a script of outcomes, then succeeds.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<bool>>,
    sent: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// `false` entries fail with a 503, `true` entries succeed.
    pub fn new(script: &[bool]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        let ok = self.script.lock().pop_front().unwrap_or(true);
        let call = {
            let mut sent = self.sent.lock();
            sent.push(message.recipient.clone());
            sent.len()
        };
        // Yield so concurrent cycles genuinely interleave
        tokio::task::yield_now().await;

        if ok {
            Ok(format!("provider-{call}"))
        } else {
            Err(ProviderError::Rejected {
                status: 503,
                body: "service unavailable".to_string(),
            })
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<ScriptedProvider>,
    pub engine: Engine,
}

pub fn harness(script: &[bool]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let provider = Arc::new(ScriptedProvider::new(script));
    let engine = Engine::new(
        store.clone(),
        provider.clone(),
        clock.clone(),
        &Config::default(),
    );
    Harness {
        store,
        clock,
        provider,
        engine,
    }
}

/// A memory store with switchable outages.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    /// `fetch_due` and `stranded` fail
    pub queue_reads_down: bool,
    /// experiment counter updates fail
    pub counters_down: bool,
}

impl FaultyStore {
    pub fn queue_reads_down() -> Self {
        Self {
            queue_reads_down: true,
            ..Default::default()
        }
    }

    pub fn counters_down() -> Self {
        Self {
            counters_down: true,
            ..Default::default()
        }
    }
}

fn outage() -> StoreError {
    StoreError::Database("connection refused".to_string())
}

#[async_trait]
impl QueueStore for FaultyStore {
    async fn insert_entry(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.inner.insert_entry(entry).await
    }

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.get_entry(id).await
    }

    async fn list_entries(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.inner.list_entries(status).await
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        if self.queue_reads_down {
            return Err(outage());
        }
        self.inner.fetch_due(now, limit).await
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.claim(id, now).await
    }

    async fn settle(&self, id: &str, settlement: Settlement) -> Result<bool, StoreError> {
        self.inner.settle(id, settlement).await
    }

    async fn stranded(&self, claimed_before: DateTime<Utc>) -> Result<Vec<QueueEntry>, StoreError> {
        if self.queue_reads_down {
            return Err(outage());
        }
        self.inner.stranded(claimed_before).await
    }

    async fn requeue_failed(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, StoreError> {
        self.inner.requeue_failed(id, now).await
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        self.inner.audit_records().await
    }
}

#[async_trait]
impl AutomationStore for FaultyStore {
    async fn upsert_automation(&self, automation: Automation) -> Result<(), StoreError> {
        self.inner.upsert_automation(automation).await
    }

    async fn get_automation(&self, id: &str) -> Result<Option<Automation>, StoreError> {
        self.inner.get_automation(id).await
    }

    async fn insert_execution(&self, execution: AutomationExecution) -> Result<(), StoreError> {
        self.inner.insert_execution(execution).await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<AutomationExecution>, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn pending_executions(&self) -> Result<Vec<AutomationExecution>, StoreError> {
        self.inner.pending_executions().await
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        entry: QueueEntry,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.complete_execution(execution_id, entry, at).await
    }

    async fn close_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.close_execution(execution_id, outcome, at).await
    }
}

#[async_trait]
impl ExperimentStore for FaultyStore {
    async fn upsert_test(&self, test: ExperimentTest) -> Result<(), StoreError> {
        self.inner.upsert_test(test).await
    }

    async fn get_test(&self, id: &str) -> Result<Option<ExperimentTest>, StoreError> {
        self.inner.get_test(id).await
    }

    async fn running_tests(&self) -> Result<Vec<ExperimentTest>, StoreError> {
        self.inner.running_tests().await
    }

    async fn complete_test(
        &self,
        id: &str,
        winner: Variant,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.complete_test(id, winner, at).await
    }

    async fn increment(
        &self,
        id: &str,
        variant: Variant,
        counter: Counter,
    ) -> Result<bool, StoreError> {
        if self.counters_down {
            return Err(outage());
        }
        self.inner.increment(id, variant, counter).await
    }
}

#[async_trait]
impl TemplateStore for FaultyStore {
    async fn upsert_template(&self, template: Template) -> Result<(), StoreError> {
        self.inner.upsert_template(template).await
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        self.inner.get_template(id).await
    }
}

#[async_trait]
impl SuppressionList for FaultyStore {
    async fn is_suppressed(&self, address: &str) -> Result<bool, StoreError> {
        self.inner.is_suppressed(address).await
    }

    async fn suppress(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.suppress(address, reason, at).await
    }
}
