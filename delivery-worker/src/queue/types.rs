//! Queue entry types.
//!
//! A [`QueueEntry`] is one outbound message. Only the dispatcher moves it
//! between [`QueueStatus`] values once it has been created as `pending`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attempts allowed when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Opaque key/value metadata carried through to the audit log.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key naming the A/B test an entry belongs to.
pub const META_EXPERIMENT_ID: &str = "experiment_id";

/// Metadata key naming the A/B variant (`A` or `B`) an entry was sent as.
pub const META_AB_VARIANT: &str = "ab_variant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    /// `sent` is final; `failed` only leaves through an operator requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status '{other}'")),
        }
    }
}

/// One outbound message awaiting or having completed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub recipient: String,
    pub subject: String,
    /// HTML body
    pub body: String,
    pub status: QueueStatus,
    /// Higher values are dispatched first
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest eligible dispatch time
    pub scheduled_at: DateTime<Utc>,
    /// Set only while a retry is pending
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the current `processing` claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub campaign_id: Option<String>,
    pub automation_id: Option<String>,
    pub template_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Whether the dispatcher may pick this entry up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending
            && self.scheduled_at <= now
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Ordering used by the dispatcher: priority descending, then schedule ascending.
    pub fn dispatch_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
            .then_with(|| a.created_at.cmp(&b.created_at))
    }

    /// The A/B test and variant this entry was sent for, if any.
    pub fn experiment_variant(&self) -> Option<(&str, &str)> {
        let test_id = self.metadata.get(META_EXPERIMENT_ID)?;
        let variant = self.metadata.get(META_AB_VARIANT)?;
        Some((test_id.as_str(), variant.as_str()))
    }
}

/// Everything an originating caller supplies when queueing a message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewQueueEntry {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub automation_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewQueueEntry {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Reject input that could never be delivered.
    pub fn validate(&self) -> Result<(), String> {
        if !self.recipient.contains('@') {
            return Err(format!("invalid recipient '{}'", self.recipient));
        }
        if self.subject.trim().is_empty() {
            return Err("subject must not be empty".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Materialize a `pending` entry with a fresh id.
    pub fn into_entry(self, now: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4().to_string(),
            recipient: self.recipient.trim().to_string(),
            subject: self.subject,
            body: self.body,
            status: QueueStatus::Pending,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            scheduled_at: self.scheduled_at.unwrap_or(now),
            next_retry_at: None,
            claimed_at: None,
            sent_at: None,
            campaign_id: self.campaign_id,
            automation_id: self.automation_id,
            template_id: self.template_id,
            provider_message_id: None,
            error_message: None,
            metadata: self.metadata,
            created_at: now,
        }
    }
}

/// Append-only record written once per entry that reaches `sent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub queue_entry_id: String,
    pub recipient: String,
    pub subject: String,
    pub status: QueueStatus,
    pub campaign_id: Option<String>,
    pub automation_id: Option<String>,
    pub template_id: Option<String>,
    pub provider_message_id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn for_sent(entry: &QueueEntry, provider_message_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            queue_entry_id: entry.id.clone(),
            recipient: entry.recipient.clone(),
            subject: entry.subject.clone(),
            status: QueueStatus::Sent,
            campaign_id: entry.campaign_id.clone(),
            automation_id: entry.automation_id.clone(),
            template_id: entry.template_id.clone(),
            provider_message_id: provider_message_id.to_string(),
            metadata: entry.metadata.clone(),
            timestamp: at,
        }
    }
}
