//! Automation rule and execution types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::hours;

/// A rule that fires a templated message some time after a trigger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Fractional hours between the trigger and the send
    pub delay_hours: f64,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Skipped,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "completed" => Ok(ExecutionStatus::Completed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// One pending instance of an automation firing for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: String,
    pub automation_id: String,
    pub subject_id: String,
    /// Event payload; `email` names the recipient, every key is a template variable
    pub trigger_data: Value,
    pub created_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<String>,
    pub queue_entry_id: Option<String>,
}

impl AutomationExecution {
    pub fn new(
        automation_id: impl Into<String>,
        subject_id: impl Into<String>,
        trigger_data: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            automation_id: automation_id.into(),
            subject_id: subject_id.into(),
            trigger_data,
            created_at,
            status: ExecutionStatus::Pending,
            executed_at: None,
            skip_reason: None,
            queue_entry_id: None,
        }
    }

    /// When this execution becomes due under `automation`.
    pub fn execute_at(&self, automation: &Automation) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(hours(automation.delay_hours))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Recipient address taken from `trigger_data.email`.
    pub fn recipient(&self) -> Option<&str> {
        self.trigger_data
            .get("email")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Terminal transition applied to an execution that did not produce a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Skipped(String),
    Failed(String),
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Skipped(_) => ExecutionStatus::Skipped,
            ExecutionOutcome::Failed(_) => ExecutionStatus::Failed,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ExecutionOutcome::Skipped(r) | ExecutionOutcome::Failed(r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn automation(delay_hours: f64) -> Automation {
        Automation {
            id: "auto-1".to_string(),
            name: "welcome".to_string(),
            active: true,
            delay_hours,
            template_id: Some("tpl-1".to_string()),
        }
    }

    #[test]
    fn test_execute_at_fractional_delay() {
        let created = Utc::now();
        let execution = AutomationExecution::new("auto-1", "user-1", json!({}), created);
        assert_eq!(
            execution.execute_at(&automation(0.01)),
            created + Duration::seconds(36)
        );
    }

    #[test]
    fn test_recipient_from_trigger_data() {
        let now = Utc::now();
        let with = AutomationExecution::new("a", "u", json!({"email": " ada@example.com "}), now);
        assert_eq!(with.recipient(), Some("ada@example.com"));

        let without = AutomationExecution::new("a", "u", json!({"name": "Ada"}), now);
        assert_eq!(without.recipient(), None);

        let wrong_type = AutomationExecution::new("a", "u", json!({"email": 42}), now);
        assert_eq!(wrong_type.recipient(), None);
    }

    #[test]
    fn test_outcome_status() {
        let skipped = ExecutionOutcome::Skipped("automation inactive".to_string());
        assert_eq!(skipped.status(), ExecutionStatus::Skipped);
        assert_eq!(skipped.reason(), "automation inactive");

        let failed = ExecutionOutcome::Failed("template not found".to_string());
        assert_eq!(failed.status(), ExecutionStatus::Failed);
    }
}
