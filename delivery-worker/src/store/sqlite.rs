//! SQLite store backend.
//!
//! All statements run on tokio-rusqlite's single background thread, which
//! serializes writes. Conditional transitions are `UPDATE ... WHERE status = ?`
//! statements whose affected-row count decides who won. Timestamps are stored
//! as fixed-width RFC 3339 text so lexical order matches time order.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use super::{
    normalize_address, AutomationStore, ExperimentStore, QueueStore, RequeueOutcome, Settlement,
    SuppressionList, TemplateStore,
};
use crate::automation::{Automation, AutomationExecution, ExecutionOutcome};
use crate::error::StoreError;
use crate::experiment::{Counter, ExperimentTest, Variant, VariantStats};
use crate::queue::{AuditRecord, Metadata, QueueEntry, QueueStatus};
use crate::template::Template;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_entries (
    id TEXT PRIMARY KEY,
    recipient TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    scheduled_at TEXT NOT NULL,
    next_retry_at TEXT,
    claimed_at TEXT,
    sent_at TEXT,
    campaign_id TEXT,
    automation_id TEXT,
    template_id TEXT,
    provider_message_id TEXT,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    CHECK (attempts <= max_attempts)
);
CREATE INDEX IF NOT EXISTS idx_queue_due ON queue_entries (status, priority DESC, scheduled_at);

CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_entry_id TEXT NOT NULL UNIQUE,
    recipient TEXT NOT NULL,
    subject TEXT NOT NULL,
    status TEXT NOT NULL,
    campaign_id TEXT,
    automation_id TEXT,
    template_id TEXT,
    provider_message_id TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS automations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    active INTEGER NOT NULL,
    delay_hours REAL NOT NULL,
    template_id TEXT
);

CREATE TABLE IF NOT EXISTS automation_executions (
    id TEXT PRIMARY KEY,
    automation_id TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    trigger_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    executed_at TEXT,
    skip_reason TEXT,
    queue_entry_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_executions_status ON automation_executions (status, created_at);

CREATE TABLE IF NOT EXISTS ab_tests (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    test_duration_hours REAL NOT NULL,
    winner_criteria TEXT NOT NULL,
    a_sent INTEGER NOT NULL DEFAULT 0,
    a_opens INTEGER NOT NULL DEFAULT 0,
    a_clicks INTEGER NOT NULL DEFAULT 0,
    b_sent INTEGER NOT NULL DEFAULT 0,
    b_opens INTEGER NOT NULL DEFAULT 0,
    b_clicks INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    winner TEXT,
    completed_at TEXT,
    CHECK ((status = 'completed') = (winner IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suppressions (
    address TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const ENTRY_COLUMNS: &str = "id, recipient, subject, body, status, priority, attempts, \
     max_attempts, scheduled_at, next_retry_at, claimed_at, sent_at, campaign_id, \
     automation_id, template_id, provider_message_id, error_message, metadata, created_at";

const EXECUTION_COLUMNS: &str = "id, automation_id, subject_id, trigger_data, created_at, \
     status, executed_at, skip_reason, queue_entry_id";

const TEST_COLUMNS: &str = "id, started_at, test_duration_hours, winner_criteria, a_sent, \
     a_opens, a_clicks, b_sent, b_opens, b_clicks, status, winner, completed_at";

/// Persistent store backed by one SQLite file.
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio_rusqlite::Connection::open(&path).await?;
        let store = Self { conn };
        store.init().await?;
        info!(path = %path.display(), "sqlite_store_opened");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(ts)
}

fn conversion_error(idx: usize, reason: impl Into<String>) -> rusqlite::Error {
    let reason: String = reason.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, reason.into())
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e.to_string()))
    })
    .transpose()
}

fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

fn get_json<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn get_count(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    Ok(raw.max(0) as u64)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        recipient: row.get(1)?,
        subject: row.get(2)?,
        body: row.get(3)?,
        status: get_parsed(row, 4)?,
        priority: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        scheduled_at: get_ts(row, 8)?,
        next_retry_at: get_opt_ts(row, 9)?,
        claimed_at: get_opt_ts(row, 10)?,
        sent_at: get_opt_ts(row, 11)?,
        campaign_id: row.get(12)?,
        automation_id: row.get(13)?,
        template_id: row.get(14)?,
        provider_message_id: row.get(15)?,
        error_message: row.get(16)?,
        metadata: get_json::<Metadata>(row, 17)?,
        created_at: get_ts(row, 18)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationExecution> {
    Ok(AutomationExecution {
        id: row.get(0)?,
        automation_id: row.get(1)?,
        subject_id: row.get(2)?,
        trigger_data: get_json(row, 3)?,
        created_at: get_ts(row, 4)?,
        status: get_parsed(row, 5)?,
        executed_at: get_opt_ts(row, 6)?,
        skip_reason: row.get(7)?,
        queue_entry_id: row.get(8)?,
    })
}

fn test_from_row(row: &Row<'_>) -> rusqlite::Result<ExperimentTest> {
    let winner: Option<String> = row.get(11)?;
    let winner = winner
        .map(|w| w.parse::<Variant>().map_err(|e| conversion_error(11, e)))
        .transpose()?;

    Ok(ExperimentTest {
        id: row.get(0)?,
        started_at: get_ts(row, 1)?,
        test_duration_hours: row.get(2)?,
        winner_criteria: get_parsed(row, 3)?,
        variant_a: VariantStats::new(get_count(row, 4)?, get_count(row, 5)?, get_count(row, 6)?),
        variant_b: VariantStats::new(get_count(row, 7)?, get_count(row, 8)?, get_count(row, 9)?),
        status: get_parsed(row, 10)?,
        winner,
        completed_at: get_opt_ts(row, 12)?,
    })
}

fn insert_entry_tx(conn: &rusqlite::Connection, entry: &QueueEntry, metadata: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO queue_entries ({ENTRY_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            entry.id,
            entry.recipient,
            entry.subject,
            entry.body,
            entry.status.as_str(),
            entry.priority,
            entry.attempts,
            entry.max_attempts,
            ts(&entry.scheduled_at),
            opt_ts(&entry.next_retry_at),
            opt_ts(&entry.claimed_at),
            opt_ts(&entry.sent_at),
            entry.campaign_id,
            entry.automation_id,
            entry.template_id,
            entry.provider_message_id,
            entry.error_message,
            metadata,
            ts(&entry.created_at),
        ],
    )?;
    Ok(())
}

// =============================================================================
// Queue
// =============================================================================

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert_entry(&self, entry: QueueEntry) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                insert_entry_tx(conn, &entry, &metadata)
            })
            .await?;
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        let id = id.to_string();
        let entry = self
            .conn
            .call(move |conn| -> Result<Option<QueueEntry>, rusqlite::Error> {
                conn.query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                    params![id],
                    entry_from_row,
                )
                .optional()
            })
            .await?;
        Ok(entry)
    }

    async fn list_entries(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let status = status.map(|s| s.as_str().to_string());
        let entries = self
            .conn
            .call(move |conn| -> Result<Vec<QueueEntry>, rusqlite::Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries \
                     WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC"
                ))?;
                let rows = stmt.query_map(params![status], entry_from_row)?;
                rows.collect()
            })
            .await?;
        Ok(entries)
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let now = ts(&now);
        let limit = limit as i64;
        let entries = self
            .conn
            .call(move |conn| -> Result<Vec<QueueEntry>, rusqlite::Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries \
                     WHERE status = 'pending' AND scheduled_at <= ?1 \
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1) \
                     ORDER BY priority DESC, scheduled_at ASC, created_at ASC \
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![now, limit], entry_from_row)?;
                rows.collect()
            })
            .await?;
        Ok(entries)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let id = id.to_string();
        let now = ts(&now);
        let changed = self
            .conn
            .call(move |conn| -> Result<usize, rusqlite::Error> {
                conn.execute(
                    "UPDATE queue_entries SET status = 'processing', claimed_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn settle(&self, id: &str, settlement: Settlement) -> Result<bool, StoreError> {
        let id = id.to_string();
        let audit_metadata = match &settlement {
            Settlement::Sent { audit, .. } => Some(serde_json::to_string(&audit.metadata)?),
            _ => None,
        };

        let settled = self
            .conn
            .call(move |conn| -> Result<bool, rusqlite::Error> {
                let tx = conn.transaction()?;
                let changed = match &settlement {
                    Settlement::Sent {
                        provider_message_id,
                        sent_at,
                        ..
                    } => tx.execute(
                        "UPDATE queue_entries SET status = 'sent', provider_message_id = ?2, \
                         sent_at = ?3, next_retry_at = NULL, error_message = NULL, \
                         claimed_at = NULL WHERE id = ?1 AND status = 'processing'",
                        params![id, provider_message_id, ts(sent_at)],
                    )?,
                    Settlement::Retry {
                        attempts,
                        next_retry_at,
                        error,
                    } => tx.execute(
                        "UPDATE queue_entries SET status = 'pending', attempts = ?2, \
                         next_retry_at = ?3, error_message = ?4, claimed_at = NULL \
                         WHERE id = ?1 AND status = 'processing'",
                        params![id, attempts, ts(next_retry_at), error],
                    )?,
                    Settlement::Failed { attempts, error } => tx.execute(
                        "UPDATE queue_entries SET status = 'failed', attempts = ?2, \
                         next_retry_at = NULL, error_message = ?3, claimed_at = NULL \
                         WHERE id = ?1 AND status = 'processing'",
                        params![id, attempts, error],
                    )?,
                };

                if changed != 1 {
                    return Ok(false);
                }

                if let Settlement::Sent { audit, .. } = &settlement {
                    tx.execute(
                        "INSERT INTO audit_log (queue_entry_id, recipient, subject, status, \
                         campaign_id, automation_id, template_id, provider_message_id, \
                         metadata, timestamp) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            audit.queue_entry_id,
                            audit.recipient,
                            audit.subject,
                            audit.status.as_str(),
                            audit.campaign_id,
                            audit.automation_id,
                            audit.template_id,
                            audit.provider_message_id,
                            audit_metadata.as_deref().unwrap_or("{}"),
                            ts(&audit.timestamp),
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(settled)
    }

    async fn stranded(&self, claimed_before: DateTime<Utc>) -> Result<Vec<QueueEntry>, StoreError> {
        let cutoff = ts(&claimed_before);
        let entries = self
            .conn
            .call(move |conn| -> Result<Vec<QueueEntry>, rusqlite::Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries \
                     WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at <= ?1)"
                ))?;
                let rows = stmt.query_map(params![cutoff], entry_from_row)?;
                rows.collect()
            })
            .await?;
        Ok(entries)
    }

    async fn requeue_failed(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, StoreError> {
        let id = id.to_string();
        let now = ts(&now);
        let outcome = self
            .conn
            .call(move |conn| -> Result<RequeueOutcome, rusqlite::Error> {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE queue_entries SET status = 'pending', attempts = 0, \
                     next_retry_at = NULL, error_message = NULL, \
                     scheduled_at = MIN(scheduled_at, ?2) \
                     WHERE id = ?1 AND status = 'failed'",
                    params![id, now],
                )?;
                let entry = tx
                    .query_row(
                        &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                        params![id],
                        entry_from_row,
                    )
                    .optional()?;
                tx.commit()?;

                Ok(match entry {
                    None => RequeueOutcome::NotFound,
                    Some(entry) if changed == 1 => RequeueOutcome::Requeued(entry),
                    Some(entry) => RequeueOutcome::NotFailed(entry.status),
                })
            })
            .await?;
        Ok(outcome)
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let records = self
            .conn
            .call(|conn| -> Result<Vec<AuditRecord>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT queue_entry_id, recipient, subject, status, campaign_id, \
                     automation_id, template_id, provider_message_id, metadata, timestamp \
                     FROM audit_log ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(AuditRecord {
                        queue_entry_id: row.get(0)?,
                        recipient: row.get(1)?,
                        subject: row.get(2)?,
                        status: get_parsed::<QueueStatus>(row, 3)?,
                        campaign_id: row.get(4)?,
                        automation_id: row.get(5)?,
                        template_id: row.get(6)?,
                        provider_message_id: row.get(7)?,
                        metadata: get_json(row, 8)?,
                        timestamp: get_ts(row, 9)?,
                    })
                })?;
                rows.collect()
            })
            .await?;
        Ok(records)
    }
}

// =============================================================================
// Automations
// =============================================================================

#[async_trait]
impl AutomationStore for SqliteStore {
    async fn upsert_automation(&self, automation: Automation) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO automations (id, name, active, delay_hours, template_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
                     active = excluded.active, delay_hours = excluded.delay_hours, \
                     template_id = excluded.template_id",
                    params![
                        automation.id,
                        automation.name,
                        automation.active,
                        automation.delay_hours,
                        automation.template_id,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_automation(&self, id: &str) -> Result<Option<Automation>, StoreError> {
        let id = id.to_string();
        let automation = self
            .conn
            .call(move |conn| -> Result<Option<Automation>, rusqlite::Error> {
                conn.query_row(
                    "SELECT id, name, active, delay_hours, template_id \
                     FROM automations WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Automation {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            active: row.get(2)?,
                            delay_hours: row.get(3)?,
                            template_id: row.get(4)?,
                        })
                    },
                )
                .optional()
            })
            .await?;
        Ok(automation)
    }

    async fn insert_execution(&self, execution: AutomationExecution) -> Result<(), StoreError> {
        let trigger_data = serde_json::to_string(&execution.trigger_data)?;
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    &format!(
                        "INSERT INTO automation_executions ({EXECUTION_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    params![
                        execution.id,
                        execution.automation_id,
                        execution.subject_id,
                        trigger_data,
                        ts(&execution.created_at),
                        execution.status.as_str(),
                        opt_ts(&execution.executed_at),
                        execution.skip_reason,
                        execution.queue_entry_id,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<AutomationExecution>, StoreError> {
        let id = id.to_string();
        let execution = self
            .conn
            .call(move |conn| -> Result<Option<AutomationExecution>, rusqlite::Error> {
                conn.query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM automation_executions WHERE id = ?1"),
                    params![id],
                    execution_from_row,
                )
                .optional()
            })
            .await?;
        Ok(execution)
    }

    async fn pending_executions(&self) -> Result<Vec<AutomationExecution>, StoreError> {
        let executions = self
            .conn
            .call(|conn| -> Result<Vec<AutomationExecution>, rusqlite::Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM automation_executions \
                     WHERE status = 'pending' ORDER BY created_at ASC"
                ))?;
                let rows = stmt.query_map([], execution_from_row)?;
                rows.collect()
            })
            .await?;
        Ok(executions)
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        entry: QueueEntry,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let execution_id = execution_id.to_string();
        let metadata = serde_json::to_string(&entry.metadata)?;
        let at = ts(&at);
        let completed = self
            .conn
            .call(move |conn| -> Result<bool, rusqlite::Error> {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE automation_executions SET status = 'completed', \
                     executed_at = ?2, queue_entry_id = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![execution_id, at, entry.id],
                )?;
                if changed != 1 {
                    return Ok(false);
                }
                insert_entry_tx(&tx, &entry, &metadata)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(completed)
    }

    async fn close_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let execution_id = execution_id.to_string();
        let status = outcome.status().as_str();
        let reason = outcome.reason().to_string();
        let at = ts(&at);
        let changed = self
            .conn
            .call(move |conn| -> Result<usize, rusqlite::Error> {
                conn.execute(
                    "UPDATE automation_executions SET status = ?2, executed_at = ?3, \
                     skip_reason = ?4 WHERE id = ?1 AND status = 'pending'",
                    params![execution_id, status, at, reason],
                )
            })
            .await?;
        Ok(changed == 1)
    }
}

// =============================================================================
// Experiments
// =============================================================================

#[async_trait]
impl ExperimentStore for SqliteStore {
    async fn upsert_test(&self, test: ExperimentTest) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO ab_tests ({TEST_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                    ),
                    params![
                        test.id,
                        ts(&test.started_at),
                        test.test_duration_hours,
                        test.winner_criteria.as_str(),
                        test.variant_a.sent as i64,
                        test.variant_a.opens as i64,
                        test.variant_a.clicks as i64,
                        test.variant_b.sent as i64,
                        test.variant_b.opens as i64,
                        test.variant_b.clicks as i64,
                        test.status.as_str(),
                        test.winner.map(|w| w.as_str()),
                        opt_ts(&test.completed_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_test(&self, id: &str) -> Result<Option<ExperimentTest>, StoreError> {
        let id = id.to_string();
        let test = self
            .conn
            .call(move |conn| -> Result<Option<ExperimentTest>, rusqlite::Error> {
                conn.query_row(
                    &format!("SELECT {TEST_COLUMNS} FROM ab_tests WHERE id = ?1"),
                    params![id],
                    test_from_row,
                )
                .optional()
            })
            .await?;
        Ok(test)
    }

    async fn running_tests(&self) -> Result<Vec<ExperimentTest>, StoreError> {
        let tests = self
            .conn
            .call(|conn| -> Result<Vec<ExperimentTest>, rusqlite::Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TEST_COLUMNS} FROM ab_tests \
                     WHERE status = 'running' ORDER BY started_at ASC"
                ))?;
                let rows = stmt.query_map([], test_from_row)?;
                rows.collect()
            })
            .await?;
        Ok(tests)
    }

    async fn complete_test(
        &self,
        id: &str,
        winner: Variant,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let at = ts(&at);
        let changed = self
            .conn
            .call(move |conn| -> Result<usize, rusqlite::Error> {
                conn.execute(
                    "UPDATE ab_tests SET status = 'completed', winner = ?2, completed_at = ?3 \
                     WHERE id = ?1 AND status = 'running'",
                    params![id, winner.as_str(), at],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn increment(
        &self,
        id: &str,
        variant: Variant,
        counter: Counter,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        // Column names come from a closed enum, never from input
        let column = counter.column(variant);
        let changed = self
            .conn
            .call(move |conn| -> Result<usize, rusqlite::Error> {
                conn.execute(
                    &format!(
                        "UPDATE ab_tests SET {column} = {column} + 1 \
                         WHERE id = ?1 AND status = 'running'"
                    ),
                    params![id],
                )
            })
            .await?;
        Ok(changed == 1)
    }
}

// =============================================================================
// Templates and suppressions
// =============================================================================

#[async_trait]
impl TemplateStore for SqliteStore {
    async fn upsert_template(&self, template: Template) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO templates (id, subject, body) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(id) DO UPDATE SET subject = excluded.subject, body = excluded.body",
                    params![template.id, template.subject, template.body],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        let id = id.to_string();
        let template = self
            .conn
            .call(move |conn| -> Result<Option<Template>, rusqlite::Error> {
                conn.query_row(
                    "SELECT id, subject, body FROM templates WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Template {
                            id: row.get(0)?,
                            subject: row.get(1)?,
                            body: row.get(2)?,
                        })
                    },
                )
                .optional()
            })
            .await?;
        Ok(template)
    }
}

#[async_trait]
impl SuppressionList for SqliteStore {
    async fn is_suppressed(&self, address: &str) -> Result<bool, StoreError> {
        let address = normalize_address(address);
        let found = self
            .conn
            .call(move |conn| -> Result<bool, rusqlite::Error> {
                let hit: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM suppressions WHERE address = ?1",
                        params![address],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(hit.is_some())
            })
            .await?;
        Ok(found)
    }

    async fn suppress(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let address = normalize_address(address);
        let reason = reason.to_string();
        let at = ts(&at);
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO suppressions (address, reason, created_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(address) DO UPDATE SET reason = excluded.reason",
                    params![address, reason, at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
