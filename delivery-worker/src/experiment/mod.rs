//! A/B experiments and the evaluator that closes them out.
//!
//! A running test is evaluated once its observation window has elapsed. The
//! winner is the variant with the strictly higher rate under the test's
//! criteria, with ties going to A.

pub mod types;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

pub use types::{
    Counter, ExperimentStatus, ExperimentTest, Variant, VariantStats, WinnerCriteria,
};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::Store;

/// A test that was closed during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub test_id: String,
    pub winner: Variant,
    pub rate_a: f64,
    pub rate_b: f64,
}

/// Counts for one experiment cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub evaluated: usize,
    pub still_running: usize,
    pub decisions: Vec<Decision>,
}

pub struct ExperimentEvaluator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ExperimentEvaluator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Commit a winner for every running test whose window has elapsed.
    pub async fn run_cycle(&self) -> Result<ExperimentSummary, StoreError> {
        let now = self.clock.now();
        let running = self.store.running_tests().await?;
        let mut summary = ExperimentSummary::default();

        for test in running {
            summary.evaluated += 1;

            if now < test.window_end() {
                summary.still_running += 1;
                continue;
            }

            let (winner, rate_a, rate_b) = test.pick_winner();

            if !self.store.complete_test(&test.id, winner, now).await? {
                warn!(test_id = %test.id, "experiment_already_completed");
                continue;
            }

            info!(
                test_id = %test.id,
                criteria = test.winner_criteria.as_str(),
                winner = %winner,
                rate_a = rate_a,
                rate_b = rate_b,
                "experiment_completed"
            );

            summary.decisions.push(Decision {
                test_id: test.id,
                winner,
                rate_a,
                rate_b,
            });
        }

        info!(
            evaluated = summary.evaluated,
            completed = summary.decisions.len(),
            still_running = summary.still_running,
            "experiment_cycle_complete"
        );

        Ok(summary)
    }
}
