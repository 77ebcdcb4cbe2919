//! The Dispatcher: turns due queue entries into provider sends.
//!
//! Per entry:
//! 1. Claim it (`pending → processing` compare-and-swap). Losing the claim
//!    means another cycle owns the entry; it is left alone.
//! 2. Suppressed recipient: `failed` with "suppressed", no attempt counted.
//! 3. Send through the provider, bounded by the send timeout.
//! 4. Success: `sent` plus one audit record, written together.
//! 5. Failure: count the attempt, then back off or give up.
//!
//! Entries within a batch run on a bounded pool of concurrent sends. One
//! entry's failure never aborts the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{ProviderError, StoreError};
use crate::experiment::{Counter, Variant};
use crate::provider::{OutboundMessage, Provider};
use crate::queue::{AuditRecord, QueueEntry, RetryDecision, RetryPolicy};
use crate::store::{RequeueOutcome, Settlement, Store};

/// Error message recorded on entries blocked by the suppression list.
pub const SUPPRESSED: &str = "suppressed";

/// Tunables for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Maximum concurrent sends within one batch
    pub concurrency: usize,
    /// Upper bound on a single provider call
    pub send_timeout: Duration,
    /// Age after which a `processing` claim is treated as stranded
    pub claim_lease: chrono::Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.dispatch_concurrency.max(1),
            send_timeout: config.provider_timeout(),
            claim_lease: config.claim_lease(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Counts for one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    /// Due entries pulled for this cycle
    pub processed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub suppressed: usize,
    /// Entries another cycle claimed first
    pub skipped: usize,
}

/// Counts for one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub stranded: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Sent,
    Retried,
    Failed,
    Suppressed,
    Skipped,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            settings,
        }
    }

    /// Pull up to `batch_size` due entries and drive each through send-or-retry.
    ///
    /// Every entry in the batch is attempted even if the store fails for one
    /// of them; the first store error is then returned for the whole cycle.
    pub async fn run_dispatch_cycle(&self, batch_size: usize) -> Result<DispatchSummary, StoreError> {
        let now = self.clock.now();
        let due = self.store.fetch_due(now, batch_size).await?;

        let mut summary = DispatchSummary {
            processed: due.len(),
            ..Default::default()
        };

        if due.is_empty() {
            debug!("dispatch_cycle_idle");
            return Ok(summary);
        }

        let results: Vec<Result<EntryOutcome, StoreError>> = stream::iter(due)
            .map(|entry| self.dispatch_entry(entry, now))
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(EntryOutcome::Sent) => summary.sent += 1,
                Ok(EntryOutcome::Retried) => summary.retried += 1,
                Ok(EntryOutcome::Failed) => summary.failed += 1,
                Ok(EntryOutcome::Suppressed) => summary.suppressed += 1,
                Ok(EntryOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(error = %e, "dispatch_entry_store_error");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            processed = summary.processed,
            sent = summary.sent,
            retried = summary.retried,
            failed = summary.failed,
            suppressed = summary.suppressed,
            skipped = summary.skipped,
            "dispatch_cycle_complete"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn dispatch_entry(
        &self,
        entry: QueueEntry,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<EntryOutcome, StoreError> {
        if !self.store.claim(&entry.id, now).await? {
            debug!(queue_entry_id = %entry.id, "queue_entry_claim_lost");
            return Ok(EntryOutcome::Skipped);
        }

        if self.store.is_suppressed(&entry.recipient).await? {
            let settled = self
                .store
                .settle(
                    &entry.id,
                    Settlement::Failed {
                        attempts: entry.attempts,
                        error: SUPPRESSED.to_string(),
                    },
                )
                .await?;
            if !settled {
                return Ok(EntryOutcome::Skipped);
            }
            info!(
                queue_entry_id = %entry.id,
                recipient = %entry.recipient,
                "queue_entry_suppressed"
            );
            return Ok(EntryOutcome::Suppressed);
        }

        match self.send(&entry).await {
            Ok(provider_message_id) => self.record_sent(&entry, provider_message_id).await,
            Err(e) => self.record_failure(&entry, &e.to_string()).await,
        }
    }

    async fn send(&self, entry: &QueueEntry) -> Result<String, ProviderError> {
        let message = OutboundMessage::from_entry(entry);
        let timeout = self.settings.send_timeout;

        match tokio::time::timeout(timeout, self.provider.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    async fn record_sent(
        &self,
        entry: &QueueEntry,
        provider_message_id: String,
    ) -> Result<EntryOutcome, StoreError> {
        // Stamp with the time the send finished, not when the batch started
        let now = self.clock.now();
        let audit = AuditRecord::for_sent(entry, &provider_message_id, now);
        let settled = self
            .store
            .settle(
                &entry.id,
                Settlement::Sent {
                    provider_message_id: provider_message_id.clone(),
                    sent_at: now,
                    audit,
                },
            )
            .await?;

        if !settled {
            // The claim was swept while the send was in flight
            warn!(
                queue_entry_id = %entry.id,
                provider_message_id = %provider_message_id,
                "queue_entry_settle_lost"
            );
            return Ok(EntryOutcome::Skipped);
        }

        info!(
            queue_entry_id = %entry.id,
            provider = self.provider.name(),
            provider_message_id = %provider_message_id,
            attempts = entry.attempts,
            "queue_entry_sent"
        );

        // The entry is already sent; a counter failure must not undo that
        if let Err(e) = self.count_experiment_send(entry).await {
            error!(queue_entry_id = %entry.id, error = %e, "experiment_send_count_failed");
        }
        Ok(EntryOutcome::Sent)
    }

    async fn count_experiment_send(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let Some((test_id, variant)) = entry.experiment_variant() else {
            return Ok(());
        };

        let variant: Variant = match variant.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(queue_entry_id = %entry.id, error = %e, "experiment_variant_invalid");
                return Ok(());
            }
        };

        if !self.store.increment(test_id, variant, Counter::Sent).await? {
            debug!(test_id = %test_id, "experiment_not_running");
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        entry: &QueueEntry,
        error: &str,
    ) -> Result<EntryOutcome, StoreError> {
        let now = self.clock.now();
        let attempts = entry.attempts.saturating_add(1).min(entry.max_attempts);

        let (settlement, outcome) =
            match self.settings.retry.decide(attempts, entry.max_attempts, now) {
                RetryDecision::RetryAt(next_retry_at) => (
                    Settlement::Retry {
                        attempts,
                        next_retry_at,
                        error: error.to_string(),
                    },
                    EntryOutcome::Retried,
                ),
                RetryDecision::GiveUp => (
                    Settlement::Failed {
                        attempts,
                        error: error.to_string(),
                    },
                    EntryOutcome::Failed,
                ),
            };

        if !self.store.settle(&entry.id, settlement.clone()).await? {
            return Ok(EntryOutcome::Skipped);
        }

        match settlement {
            Settlement::Retry { next_retry_at, .. } => warn!(
                queue_entry_id = %entry.id,
                attempts = attempts,
                max_attempts = entry.max_attempts,
                next_retry_at = %next_retry_at,
                error = %error,
                "queue_entry_retry_scheduled"
            ),
            _ => error!(
                queue_entry_id = %entry.id,
                attempts = attempts,
                error = %error,
                "queue_entry_failed"
            ),
        }

        Ok(outcome)
    }

    /// Recover entries stranded in `processing` past the claim lease.
    ///
    /// The send outcome of a stranded claim is unknown, so it counts as one
    /// failed attempt and goes through the normal backoff policy.
    pub async fn sweep_stranded(&self) -> Result<SweepSummary, StoreError> {
        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(self.settings.claim_lease)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let stranded = self.store.stranded(cutoff).await?;

        let mut summary = SweepSummary {
            stranded: stranded.len(),
            ..Default::default()
        };

        for entry in &stranded {
            match self.record_failure(entry, "claim lease expired").await? {
                EntryOutcome::Retried => summary.rescheduled += 1,
                EntryOutcome::Failed => summary.failed += 1,
                _ => {}
            }
        }

        info!(
            stranded = summary.stranded,
            rescheduled = summary.rescheduled,
            failed = summary.failed,
            "retry_sweep_complete"
        );

        Ok(summary)
    }

    /// Operator action: put a `failed` entry back in the queue with a fresh
    /// attempt budget.
    pub async fn requeue_failed(&self, id: &str) -> Result<RequeueOutcome, StoreError> {
        let outcome = self.store.requeue_failed(id, self.clock.now()).await?;

        match &outcome {
            RequeueOutcome::Requeued(_) => info!(queue_entry_id = %id, "queue_entry_requeued"),
            RequeueOutcome::NotFound => warn!(queue_entry_id = %id, "queue_entry_requeue_missing"),
            RequeueOutcome::NotFailed(status) => warn!(
                queue_entry_id = %id,
                status = %status,
                "queue_entry_requeue_rejected"
            ),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::experiment::{ExperimentTest, WinnerCriteria};
    use crate::queue::{NewQueueEntry, QueueStatus, META_AB_VARIANT, META_EXPERIMENT_ID};
    use crate::store::{ExperimentStore, MemoryStore, QueueStore, SuppressionList};

    /// Replays a fixed script of results, then succeeds.
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<String, u16>>>,
        calls: Mutex<Vec<String>>,
        stall: bool,
    }

    impl ScriptedProvider {
        fn with(script: Vec<Result<String, u16>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
            self.calls.lock().push(message.recipient.clone());
            if self.stall {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(Ok(id)) => Ok(id),
                Some(Err(status)) => Err(ProviderError::Rejected {
                    status,
                    body: "scripted failure".to_string(),
                }),
                None => Ok(format!("msg-{}", self.calls())),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        provider: Arc<ScriptedProvider>,
        dispatcher: Dispatcher,
    }

    fn fixture(provider: ScriptedProvider) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let provider = Arc::new(provider);
        let settings = DispatchSettings {
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let dispatcher =
            Dispatcher::new(store.clone(), provider.clone(), clock.clone(), settings);
        Fixture {
            store,
            clock,
            provider,
            dispatcher,
        }
    }

    async fn enqueue(fx: &Fixture, recipient: &str, priority: i32) -> String {
        let mut new = NewQueueEntry::new(recipient, "Hello", "<p>Hi</p>");
        new.priority = priority;
        let entry = new.into_entry(fx.clock.now());
        let id = entry.id.clone();
        fx.store.insert_entry(entry).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_sends_in_priority_order_and_audits() {
        let fx = fixture(ScriptedProvider::default());
        let low = enqueue(&fx, "low@example.com", 0).await;
        let high = enqueue(&fx, "high@example.com", 10).await;

        let summary = fx.dispatcher.run_dispatch_cycle(10).await.unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(
            *fx.provider.calls.lock(),
            vec!["high@example.com".to_string(), "low@example.com".to_string()]
        );

        for id in [&low, &high] {
            let entry = fx.store.get_entry(id).await.unwrap().unwrap();
            assert_eq!(entry.status, QueueStatus::Sent);
            assert_eq!(entry.attempts, 0);
            assert!(entry.provider_message_id.is_some());
        }
        assert_eq!(fx.store.audit_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_the_cycle() {
        let fx = fixture(ScriptedProvider::default());
        for i in 0..5 {
            enqueue(&fx, &format!("user{i}@example.com"), 0).await;
        }

        let summary = fx.dispatcher.run_dispatch_cycle(2).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(
            fx.store.list_entries(Some(QueueStatus::Pending)).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let fx = fixture(ScriptedProvider::with(vec![Err(503)]));
        let id = enqueue(&fx, "ada@example.com", 0).await;
        let start = fx.clock.now();

        let summary = fx.dispatcher.run_dispatch_cycle(10).await.unwrap();
        assert_eq!(summary.retried, 1);

        let entry = fx.store.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_retry_at, Some(start + ChronoDuration::minutes(2)));
        assert!(entry.error_message.unwrap().contains("503"));

        // Not eligible until the backoff elapses
        fx.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(fx.dispatcher.run_dispatch_cycle(10).await.unwrap().processed, 0);

        fx.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(fx.dispatcher.run_dispatch_cycle(10).await.unwrap().sent, 1);
    }

    /// Advances the manual clock by `takes` on every send.
    struct SlowProvider {
        clock: Arc<ManualClock>,
        takes: ChronoDuration,
        fail: bool,
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(&self, _message: &OutboundMessage) -> Result<String, ProviderError> {
            self.clock.advance(self.takes);
            if self.fail {
                Err(ProviderError::Rejected {
                    status: 503,
                    body: "busy".to_string(),
                })
            } else {
                Ok("slow-1".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_settlement_uses_send_completion_time() {
        for fail in [false, true] {
            let store = Arc::new(MemoryStore::new());
            let start = Utc::now();
            let clock = Arc::new(ManualClock::new(start));
            let takes = ChronoDuration::seconds(40);
            let provider = Arc::new(SlowProvider {
                clock: clock.clone(),
                takes,
                fail,
            });
            let dispatcher = Dispatcher::new(
                store.clone(),
                provider,
                clock.clone(),
                DispatchSettings::default(),
            );

            let entry = NewQueueEntry::new("ada@example.com", "Hello", "").into_entry(start);
            let id = entry.id.clone();
            store.insert_entry(entry).await.unwrap();
            dispatcher.run_dispatch_cycle(10).await.unwrap();

            let entry = store.get_entry(&id).await.unwrap().unwrap();
            if fail {
                assert_eq!(
                    entry.next_retry_at,
                    Some(start + takes + ChronoDuration::minutes(2))
                );
            } else {
                assert_eq!(entry.sent_at, Some(start + takes));
                let audit = store.audit_records().await.unwrap();
                assert_eq!(audit[0].timestamp, start + takes);
            }
        }
    }

    #[tokio::test]
    async fn test_huge_claim_lease_never_strands_in_flight_claims() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = Config {
            claim_lease_secs: u64::MAX,
            ..Config::default()
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(ScriptedProvider::default()),
            clock.clone(),
            DispatchSettings::from_config(&config),
        );

        let entry = NewQueueEntry::new("ada@example.com", "Hello", "").into_entry(clock.now());
        let id = entry.id.clone();
        store.insert_entry(entry).await.unwrap();
        assert!(store.claim(&id, clock.now()).await.unwrap());

        clock.advance(ChronoDuration::days(365));
        assert_eq!(dispatcher.sweep_stranded().await.unwrap().stranded, 0);
        let entry = store.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Processing);
    }

    #[tokio::test]
    async fn test_suppressed_recipient_fails_without_send() {
        let fx = fixture(ScriptedProvider::default());
        let id = enqueue(&fx, "Blocked@Example.com", 0).await;
        fx.store
            .suppress("blocked@example.com", "bounced", fx.clock.now())
            .await
            .unwrap();

        let summary = fx.dispatcher.run_dispatch_cycle(10).await.unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(fx.provider.calls(), 0);

        let entry = fx.store.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.error_message.as_deref(), Some(SUPPRESSED));
        assert!(entry.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let fx = fixture(ScriptedProvider {
            stall: true,
            ..Default::default()
        });
        let id = enqueue(&fx, "slow@example.com", 0).await;

        let summary = fx.dispatcher.run_dispatch_cycle(10).await.unwrap();
        assert_eq!(summary.retried, 1);

        let entry = fx.store.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_sweep_recovers_stranded_claims() {
        let fx = fixture(ScriptedProvider::default());
        let id = enqueue(&fx, "ada@example.com", 0).await;
        assert!(fx.store.claim(&id, fx.clock.now()).await.unwrap());

        // Within the lease nothing happens
        assert_eq!(fx.dispatcher.sweep_stranded().await.unwrap().stranded, 0);

        fx.clock.advance(ChronoDuration::minutes(6));
        let summary = fx.dispatcher.sweep_stranded().await.unwrap();
        assert_eq!(summary.rescheduled, 1);

        let entry = fx.store.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert!(entry.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_requeue_resets_attempts() {
        let fx = fixture(ScriptedProvider::default());
        let mut new = NewQueueEntry::new("ada@example.com", "Hello", "<p>Hi</p>");
        new.max_attempts = Some(1);
        let entry = new.into_entry(fx.clock.now());
        let id = entry.id.clone();
        fx.store.insert_entry(entry).await.unwrap();

        *fx.provider.script.lock() = vec![Err(500)].into();
        assert_eq!(fx.dispatcher.run_dispatch_cycle(10).await.unwrap().failed, 1);

        match fx.dispatcher.requeue_failed(&id).await.unwrap() {
            RequeueOutcome::Requeued(entry) => assert_eq!(entry.attempts, 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.dispatcher.run_dispatch_cycle(10).await.unwrap().sent, 1);
        assert!(matches!(
            fx.dispatcher.requeue_failed(&id).await.unwrap(),
            RequeueOutcome::NotFailed(QueueStatus::Sent)
        ));
    }

    #[tokio::test]
    async fn test_send_bumps_experiment_counter() {
        let fx = fixture(ScriptedProvider::default());
        fx.store
            .upsert_test(ExperimentTest::new(
                "subject-test",
                fx.clock.now(),
                24.0,
                WinnerCriteria::OpenRate,
            ))
            .await
            .unwrap();

        let mut new = NewQueueEntry::new("ada@example.com", "Variant B", "<p>B</p>");
        new.metadata
            .insert(META_EXPERIMENT_ID.to_string(), "subject-test".to_string());
        new.metadata
            .insert(META_AB_VARIANT.to_string(), "B".to_string());
        fx.store
            .insert_entry(new.into_entry(fx.clock.now()))
            .await
            .unwrap();

        fx.dispatcher.run_dispatch_cycle(10).await.unwrap();

        let test = fx.store.get_test("subject-test").await.unwrap().unwrap();
        assert_eq!(test.variant_b.sent, 1);
        assert_eq!(test.variant_a.sent, 0);
    }
}
