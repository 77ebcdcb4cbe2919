//! Provider adapters: the single `send` capability behind which every
//! outbound backend lives.
//!
//! Backends:
//! - `mailgun`: Mailgun messages API, metadata forwarded as `v:` user variables
//! - `resend`: Resend emails API, metadata forwarded as tags
//! - `log`: dry run, logs the message and fabricates an id

pub mod log;
pub mod mailgun;
pub mod resend;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

pub use self::log::LogProvider;
pub use mailgun::MailgunProvider;
pub use resend::ResendProvider;

use crate::config::{Config, ProviderKind};
use crate::error::ProviderError;
use crate::queue::{Metadata, QueueEntry};

/// What a provider needs to deliver one message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub recipient: String,
    pub subject: String,
    pub html: String,
    pub metadata: Metadata,
}

impl OutboundMessage {
    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            recipient: entry.recipient.clone(),
            subject: entry.subject.clone(),
            html: entry.body.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand one message to the backend, returning its message id.
    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError>;
}

/// Build the provider selected by `config.provider`.
///
/// A selected backend with missing credentials is a startup error.
pub fn build_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let client = Client::builder()
        .timeout(config.provider_timeout())
        .user_agent(concat!("mailflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let provider: Arc<dyn Provider> = match config.provider {
        ProviderKind::Mailgun => {
            let (Some(api_key), Some(domain)) = (&config.mailgun_api_key, &config.mailgun_domain)
            else {
                bail!("EMAIL_PROVIDER=mailgun requires MAILGUN_API_KEY and MAILGUN_DOMAIN");
            };
            Arc::new(MailgunProvider::new(
                client,
                &config.mailgun_api_base,
                domain,
                api_key,
                &config.from_address,
            )?)
        }
        ProviderKind::Resend => {
            let Some(api_key) = &config.resend_api_key else {
                bail!("EMAIL_PROVIDER=resend requires RESEND_API_KEY");
            };
            Arc::new(ResendProvider::new(
                client,
                &config.resend_api_base,
                api_key,
                &config.from_address,
            )?)
        }
        ProviderKind::Log => Arc::new(LogProvider::new(&config.from_address)),
    };

    Ok(provider)
}

/// Join `path` onto `base`, keeping any path prefix `base` already has.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url, ProviderError> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)
        .and_then(|url| url.join(path.trim_start_matches('/')))
        .map_err(|e| ProviderError::Config(format!("invalid API base '{base}': {e}")))
}

/// Turn a non-2xx response into a rejection carrying status and body.
pub(crate) async fn rejection(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Rejected { status, body }
}
