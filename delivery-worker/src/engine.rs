//! One engine cycle: the four jobs, each timed and failure-isolated.
//!
//! ```text
//! dispatch → retry_sweep → automation → experiment
//! ```
//!
//! A job only fails when its store does; the report then marks that job and
//! the whole cycle unsuccessful, and the remaining jobs still run.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::automation::AutomationScheduler;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::error::StoreError;
use crate::experiment::ExperimentEvaluator;
use crate::provider::{build_provider, Provider};
use crate::queue::{NewQueueEntry, QueueEntry};
use crate::store::{MemoryStore, SqliteStore, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Dispatch,
    RetrySweep,
    Automation,
    Experiment,
}

impl JobKind {
    /// Every job, in the order a cycle runs them.
    pub const ALL: [JobKind; 4] = [
        JobKind::Dispatch,
        JobKind::RetrySweep,
        JobKind::Automation,
        JobKind::Experiment,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Dispatch => "dispatch",
            JobKind::RetrySweep => "retry_sweep",
            JobKind::Automation => "automation",
            JobKind::Experiment => "experiment",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job: JobKind,
    pub success: bool,
    /// The job's summary, or `{"error": ...}`
    pub details: Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub success: bool,
    pub total_duration_ms: u64,
    pub results: Vec<JobResult>,
}

impl CycleReport {
    pub fn job(&self, kind: JobKind) -> Option<&JobResult> {
        self.results.iter().find(|r| r.job == kind)
    }
}

pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    automation: AutomationScheduler,
    experiments: ExperimentEvaluator,
    batch_size: usize,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            provider,
            clock.clone(),
            DispatchSettings::from_config(config),
        );
        Self {
            automation: AutomationScheduler::new(store.clone(), clock.clone()),
            experiments: ExperimentEvaluator::new(store.clone(), clock.clone()),
            dispatcher,
            store,
            clock,
            batch_size: config.dispatch_batch_size.max(1),
        }
    }

    /// Wire the store, provider and wall clock described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.database_path {
            Some(path) => Arc::new(
                SqliteStore::open(path)
                    .await
                    .with_context(|| format!("Failed to open database at {path}"))?,
            ),
            None => {
                info!("using_in_memory_store");
                Arc::new(MemoryStore::new())
            }
        };

        let provider = build_provider(config)?;
        info!(provider = provider.name(), "provider_configured");

        Ok(Self::new(store, provider, Arc::new(SystemClock), config))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Persist a caller-supplied message as a new `pending` entry.
    pub async fn enqueue(&self, new_entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        let entry = new_entry.into_entry(self.clock.now());
        self.store.insert_entry(entry.clone()).await?;
        info!(
            queue_entry_id = %entry.id,
            priority = entry.priority,
            scheduled_at = %entry.scheduled_at,
            "queue_entry_created"
        );
        Ok(entry)
    }

    /// Run every job once, in order.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut results = Vec::with_capacity(JobKind::ALL.len());

        for job in JobKind::ALL {
            results.push(self.run_job(job).await);
        }

        let report = CycleReport {
            success: results.iter().all(|r| r.success),
            total_duration_ms: elapsed_ms(started),
            results,
        };

        info!(
            success = report.success,
            total_duration_ms = report.total_duration_ms,
            "engine_cycle_complete"
        );

        report
    }

    pub async fn run_job(&self, job: JobKind) -> JobResult {
        let started = Instant::now();

        let outcome = match job {
            JobKind::Dispatch => self
                .dispatcher
                .run_dispatch_cycle(self.batch_size)
                .await
                .map(|s| to_details(&s)),
            JobKind::RetrySweep => self
                .dispatcher
                .sweep_stranded()
                .await
                .map(|s| to_details(&s)),
            JobKind::Automation => self.automation.run_cycle().await.map(|s| to_details(&s)),
            JobKind::Experiment => self.experiments.run_cycle().await.map(|s| to_details(&s)),
        };

        let duration_ms = elapsed_ms(started);
        match outcome {
            Ok(details) => JobResult {
                job,
                success: true,
                details,
                duration_ms,
            },
            Err(e) => {
                error!(job = job.name(), error = %e, duration_ms = duration_ms, "job_failed");
                JobResult {
                    job,
                    success: false,
                    details: json!({ "error": e.to_string() }),
                    duration_ms,
                }
            }
        }
    }
}

fn to_details<T: Serialize>(summary: &T) -> Value {
    serde_json::to_value(summary).unwrap_or_default()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
