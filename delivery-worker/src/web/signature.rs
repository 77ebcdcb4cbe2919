//! Request authentication: Mailgun webhook signatures and the cron bearer token.
//!
//! Mailgun signs each webhook with HMAC-SHA256 over `timestamp + token`.
//! Reference: https://documentation.mailgun.com/docs/mailgun/user-manual/events/webhooks/#securing-webhooks

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The `signature` object Mailgun sends with every event webhook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailgunSignature {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature fields missing")]
    MissingFields,

    #[error("timestamp is not a unix epoch: {0}")]
    InvalidTimestamp(String),

    #[error("timestamp is {age_seconds}s away from now (max {max_age_seconds}s)")]
    Stale { age_seconds: u64, max_age_seconds: u64 },

    #[error("signature mismatch")]
    Mismatch,
}

impl MailgunSignature {
    /// Check the HMAC and reject timestamps more than `max_age_seconds` away
    /// from `now_unix` (replay protection).
    pub fn verify(
        &self,
        signing_key: &str,
        max_age_seconds: u64,
        now_unix: i64,
    ) -> Result<(), SignatureError> {
        if signing_key.is_empty()
            || self.timestamp.is_empty()
            || self.token.is_empty()
            || self.signature.is_empty()
        {
            return Err(SignatureError::MissingFields);
        }

        let webhook_time: i64 = self
            .timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(self.timestamp.clone()))?;

        let age_seconds = now_unix.abs_diff(webhook_time);
        if age_seconds > max_age_seconds {
            return Err(SignatureError::Stale {
                age_seconds,
                max_age_seconds,
            });
        }

        let expected = sign(signing_key, &self.timestamp, &self.token)
            .ok_or(SignatureError::Mismatch)?;

        if constant_time_compare(&expected, &self.signature.to_ascii_lowercase()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

/// Hex HMAC-SHA256 of `timestamp + token` under `signing_key`.
pub fn sign(signing_key: &str, timestamp: &str, token: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Whether an `Authorization` header value carries `Bearer <secret>`.
pub fn bearer_matches(header: Option<&str>, secret: &str) -> bool {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|token| constant_time_compare(token.trim(), secret))
        .unwrap_or(false)
}

/// Constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Verification is on only when a non-blank signing key is configured.
pub fn is_signature_verification_enabled(signing_key: &Option<String>) -> bool {
    signing_key
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}
