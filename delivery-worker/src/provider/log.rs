//! Dry-run provider. Nothing leaves the process.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{OutboundMessage, Provider};
use crate::error::ProviderError;

pub struct LogProvider {
    from: String,
}

impl LogProvider {
    pub fn new(from: &str) -> Self {
        Self {
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl Provider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        let id = format!("log-{}", Uuid::new_v4());
        info!(
            provider_message_id = %id,
            from = %self.from,
            to = %message.recipient,
            subject = %message.subject,
            html_length = message.html.len(),
            "log_provider_send"
        );
        Ok(id)
    }
}
