//! Resend emails API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{endpoint, rejection, OutboundMessage, Provider};
use crate::error::ProviderError;

pub struct ResendProvider {
    client: Client,
    url: Url,
    api_key: String,
    from: String,
}

/// Resend caps tag names and values at this many characters.
const TAG_MAX_LEN: usize = 256;

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct Tag {
    name: String,
    value: String,
}

impl Tag {
    /// Build a tag Resend will accept, or `None` if nothing usable is left.
    fn from_metadata(name: &str, value: &str) -> Option<Self> {
        Some(Self {
            name: tag_text(name)?,
            value: tag_text(value)?,
        })
    }
}

/// Map text onto Resend's tag alphabet (`[A-Za-z0-9_-]`), replacing anything
/// else with `_` and truncating to the length limit.
fn tag_text(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .take(TAG_MAX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

impl ResendProvider {
    pub fn new(
        client: Client,
        api_base: &str,
        api_key: &str,
        from: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client,
            url: endpoint(api_base, "emails")?,
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl Provider for ResendProvider {
    fn name(&self) -> &'static str {
        "resend"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        let request = SendRequest {
            from: &self.from,
            to: [message.recipient.as_str()],
            subject: &message.subject,
            html: &message.html,
            tags: message
                .metadata
                .iter()
                .filter_map(|(name, value)| Tag::from_metadata(name, value))
                .collect(),
        };

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let body = response.text().await?;
        let parsed: SendResponse =
            serde_json::from_str(&body).map_err(|_| ProviderError::MissingId)?;
        let id = parsed
            .id
            .filter(|id| !id.is_empty())
            .ok_or(ProviderError::MissingId)?;

        debug!(provider_message_id = %id, "resend_message_accepted");
        Ok(id)
    }
}
