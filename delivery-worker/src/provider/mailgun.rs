//! Mailgun messages API.
//!
//! Reference: https://documentation.mailgun.com/docs/mailgun/api-reference/openapi-final/tag/Messages/

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{endpoint, rejection, OutboundMessage, Provider};
use crate::error::ProviderError;

pub struct MailgunProvider {
    client: Client,
    url: Url,
    api_key: String,
    from: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

impl MailgunProvider {
    pub fn new(
        client: Client,
        api_base: &str,
        domain: &str,
        api_key: &str,
        from: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client,
            url: endpoint(api_base, &format!("v3/{domain}/messages"))?,
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }

    fn form(&self, message: &OutboundMessage) -> Vec<(String, String)> {
        let mut form = vec![
            ("from".to_string(), self.from.clone()),
            ("to".to_string(), message.recipient.clone()),
            ("subject".to_string(), message.subject.clone()),
            ("html".to_string(), message.html.clone()),
        ];
        // User variables come back on every event for this message
        for (key, value) in &message.metadata {
            form.push((format!("v:{key}"), value.clone()));
        }
        form
    }
}

#[async_trait]
impl Provider for MailgunProvider {
    fn name(&self) -> &'static str {
        "mailgun"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.url.clone())
            .basic_auth("api", Some(&self.api_key))
            .form(&self.form(message))
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

        debug!(provider_message_id = %id, "mailgun_message_accepted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::queue::META_AB_VARIANT;

    fn message() -> OutboundMessage {
        let mut message = OutboundMessage {
            recipient: "ada@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
            metadata: Default::default(),
        };
        message
            .metadata
            .insert(META_AB_VARIANT.to_string(), "B".to_string());
        message
    }

    fn provider(server: &MockServer) -> MailgunProvider {
        MailgunProvider::new(
            Client::new(),
            &server.uri(),
            "mg.example.com",
            "key-123",
            "news@example.com",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mg.example.com/messages"))
            .and(header_exists("authorization"))
            .and(body_string_contains("to=ada%40example.com"))
            .and(body_string_contains("v%3Aab_variant=B"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "<20260101.1@mg.example.com>",
                "message": "Queued. Thank you."
            })))
            .mount(&server)
            .await;

        let id = provider(&server).send(&message()).await.unwrap();
        assert_eq!(id, "<20260101.1@mg.example.com>");
    }

    #[tokio::test]
    async fn test_rejection_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        match provider(&server).send(&message()).await {
            Err(ProviderError::Rejected { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "try later");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_without_id_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "ok"})))
            .mount(&server)
            .await;

        assert!(matches!(
            provider(&server).send(&message()).await,
            Err(ProviderError::MissingId)
        ));
    }
}
