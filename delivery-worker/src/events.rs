//! Delivery events reported back by the provider.
//!
//! Bounces, complaints and unsubscribes feed the suppression list. Opens and
//! clicks on experiment sends feed that test's engagement counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::experiment::{Counter, Variant};
use crate::queue::{META_AB_VARIANT, META_EXPERIMENT_ID};
use crate::store::Store;

/// Mailgun's `event-data` object, reduced to the fields the engine acts on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailgunEventData {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, rename = "user-variables")]
    pub user_variables: HashMap<String, serde_json::Value>,
}

/// A provider event the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Suppress { recipient: String, reason: &'static str },
    Engagement {
        test_id: String,
        variant: Variant,
        counter: Counter,
    },
    Ignored { event: String },
}

/// What applying an event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventEffect {
    Suppressed,
    Counted,
    /// Engagement for a test that is not running (or does not exist)
    NotRunning,
    Ignored,
}

impl MailgunEventData {
    pub fn classify(&self) -> DeliveryEvent {
        let recipient = self.recipient.trim().to_string();

        match self.event.as_str() {
            "failed" if self.severity.as_deref() == Some("permanent") && !recipient.is_empty() => {
                DeliveryEvent::Suppress {
                    recipient,
                    reason: "bounced",
                }
            }
            "complained" if !recipient.is_empty() => DeliveryEvent::Suppress {
                recipient,
                reason: "complained",
            },
            "unsubscribed" if !recipient.is_empty() => DeliveryEvent::Suppress {
                recipient,
                reason: "unsubscribed",
            },
            "opened" | "clicked" => {
                let counter = if self.event == "opened" {
                    Counter::Opens
                } else {
                    Counter::Clicks
                };
                match self.experiment_variant() {
                    Some((test_id, variant)) => DeliveryEvent::Engagement {
                        test_id,
                        variant,
                        counter,
                    },
                    None => DeliveryEvent::Ignored {
                        event: self.event.clone(),
                    },
                }
            }
            _ => DeliveryEvent::Ignored {
                event: self.event.clone(),
            },
        }
    }

    fn experiment_variant(&self) -> Option<(String, Variant)> {
        let test_id = self.variable(META_EXPERIMENT_ID)?;
        let variant = self.variable(META_AB_VARIANT)?.parse().ok()?;
        Some((test_id, variant))
    }

    fn variable(&self, key: &str) -> Option<String> {
        match self.user_variables.get(key)? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Record the effect of `event` in the store.
pub async fn apply_event(
    store: &dyn Store,
    event: &DeliveryEvent,
    now: DateTime<Utc>,
) -> Result<EventEffect, StoreError> {
    match event {
        DeliveryEvent::Suppress { recipient, reason } => {
            store.suppress(recipient, reason, now).await?;
            info!(recipient = %recipient, reason = *reason, "recipient_suppressed");
            Ok(EventEffect::Suppressed)
        }
        DeliveryEvent::Engagement {
            test_id,
            variant,
            counter,
        } => {
            if store.increment(test_id, *variant, *counter).await? {
                debug!(
                    test_id = %test_id,
                    variant = %variant,
                    counter = counter.column(*variant),
                    "experiment_engagement_counted"
                );
                Ok(EventEffect::Counted)
            } else {
                debug!(test_id = %test_id, "experiment_not_running");
                Ok(EventEffect::NotRunning)
            }
        }
        DeliveryEvent::Ignored { event } => {
            debug!(event = %event, "provider_event_ignored");
            Ok(EventEffect::Ignored)
        }
    }
}
