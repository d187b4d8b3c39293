//! HTTP webhook channel.
//!
//! POSTs the raw notification payload to a fixed URL. The response status
//! decides how a failure is classified:
//!
//! | Response                      | Result      |
//! |-------------------------------|-------------|
//! | 2xx                           | delivered   |
//! | 408, 429, 5xx                 | transient   |
//! | any other status              | permanent   |
//! | timeout / connection error    | transient   |

use crate::core::{ChannelId, ChannelSender, Delivery};
use crate::error::SendError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub const HEADER_NOTIFICATION_ID: &str = "X-Notification-Id";
pub const HEADER_TOPIC: &str = "X-Notification-Topic";
pub const HEADER_ATTEMPT: &str = "X-Delivery-Attempt";

/// Metadata key whose value, when present, becomes the request Content-Type.
pub const CONTENT_TYPE_KEY: &str = "content-type";

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: ChannelId,
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
}

impl WebhookConfig {
    pub fn new(id: impl Into<ChannelId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            timeout_ms: default_timeout_ms(),
            headers: BTreeMap::new(),
            bearer_token: None,
            queue_capacity: None,
            workers: None,
        }
    }
}

pub struct WebhookSender {
    client: reqwest::Client,
    url: Url,
    headers: BTreeMap<String, String>,
    bearer_token: Option<String>,
}

impl WebhookSender {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let url = Url::parse(&config.url)
            .with_context(|| format!("invalid webhook url for channel {}", config.id))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            headers: config.headers.clone(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    fn classify_status(status: StatusCode) -> Result<(), SendError> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            Err(SendError::Transient(format!("HTTP {status}")))
        } else {
            Err(SendError::Permanent(format!("HTTP {status}")))
        }
    }

    fn classify_error(err: reqwest::Error) -> SendError {
        if err.is_builder() {
            SendError::Permanent(err.to_string())
        } else if err.is_timeout() {
            SendError::Transient(format!("timeout: {err}"))
        } else {
            SendError::Transient(err.to_string())
        }
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip_all, fields(url = %self.url, notification_id = %delivery.notification.id))]
    async fn send(&self, delivery: &Delivery) -> Result<(), SendError> {
        let n = &delivery.notification;
        let content_type = n
            .metadata
            .get(CONTENT_TYPE_KEY)
            .map(String::as_str)
            .unwrap_or("application/octet-stream");

        let mut request = self
            .client
            .post(self.url.clone())
            .header(HEADER_NOTIFICATION_ID, n.id.to_string())
            .header(HEADER_TOPIC, n.topic.as_str())
            .header(HEADER_ATTEMPT, delivery.attempt.to_string())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(n.payload.clone());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Self::classify_error)?;
        let status = response.status();
        debug!(status = %status, "Webhook responded");
        Self::classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Notification, Subscription};
    use crate::filter::Filter;
    use std::sync::Arc;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn delivery(payload: &str) -> Delivery {
        let sub = Subscription::new("orders", Filter::accept_all(), "hook".into());
        let notification = Notification::new("orders", payload)
            .with_metadata(CONTENT_TYPE_KEY, "application/json");
        let mut delivery = Delivery::new(Arc::new(notification), &sub);
        delivery.attempt = 1;
        delivery
    }

    async fn sender_for(server: &MockServer, status: u16) -> WebhookSender {
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
        WebhookSender::new(&WebhookConfig::new("hook", format!("{}/hook", server.uri()))).unwrap()
    }

    #[tokio::test]
    async fn test_posts_payload_with_delivery_headers() {
        // Arrange
        let server = MockServer::start().await;
        let d = delivery(r#"{"order":1}"#);
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(HEADER_NOTIFICATION_ID, d.notification.id.to_string().as_str()))
            .and(header(HEADER_TOPIC, "orders"))
            .and(header(HEADER_ATTEMPT, "1"))
            .and(header("content-type", "application/json"))
            .and(header("authorization", "Bearer secret"))
            .and(header("x-tenant", "acme"))
            .and(body_bytes(r#"{"order":1}"#.as_bytes().to_vec()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = WebhookConfig::new("hook", format!("{}/hook", server.uri()));
        config.bearer_token = Some("secret".to_string());
        config.headers.insert("x-tenant".to_string(), "acme".to_string());
        let sender = WebhookSender::new(&config).unwrap();

        // Act
        let result = sender.send(&d).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_server_errors_and_throttling_are_transient() {
        for status in [500, 503, 429, 408] {
            let server = MockServer::start().await;
            let sender = sender_for(&server, status).await;
            let err = sender.send(&delivery("{}")).await.unwrap_err();
            assert!(err.is_transient(), "status {status} should be transient");
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        for status in [400, 401, 404, 422] {
            let server = MockServer::start().await;
            let sender = sender_for(&server, status).await;
            let err = sender.send(&delivery("{}")).await.unwrap_err();
            assert!(!err.is_transient(), "status {status} should be permanent");
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let mut config = WebhookConfig::new("hook", format!("{}/hook", server.uri()));
        config.timeout_ms = 50;
        let sender = WebhookSender::new(&config).unwrap();

        let err = sender.send(&delivery("{}")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("timeout"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender =
            WebhookSender::new(&WebhookConfig::new("hook", format!("http://{addr}/hook"))).unwrap();
        let err = sender.send(&delivery("{}")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(WebhookSender::new(&WebhookConfig::new("hook", "not a url")).is_err());
    }
}
