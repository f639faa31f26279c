//! Chat message relay to the primary server's REST webhook.
//!
//! The response body is passed back untouched. Transport failures are
//! split into reset, refused and timeout so callers can tell a crashed
//! server from one that is still loading.

use crate::config::{RelayConfig, SupervisorSettings};
use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, error};

/// Payload forwarded to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
}

impl ChatMessage {
    /// Reject empty senders and messages.
    pub fn validate(&self) -> Result<()> {
        if self.sender.trim().is_empty() {
            return Err(WardenError::Validation {
                field: "sender".into(),
                message: "sender is required".into(),
            });
        }
        if self.message.trim().is_empty() {
            return Err(WardenError::Validation {
                field: "message".into(),
                message: "message is required".into(),
            });
        }
        Ok(())
    }
}

/// HTTP client for the primary server's webhook.
#[derive(Debug, Clone)]
pub struct MessageRelay {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl MessageRelay {
    pub fn new(settings: &SupervisorSettings) -> Result<Self> {
        Self::with_url(settings.webhook_url(), RelayConfig::REQUEST_TIMEOUT)
    }

    pub fn with_url(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url).map_err(|e| WardenError::Config {
            message: format!("invalid webhook URL '{}': {}", url, e),
        })?;

        let client = reqwest::Client::builder()
            .user_agent("botwarden")
            .build()
            .map_err(|e| WardenError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            url,
            client,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward a message and return the server's JSON reply as-is.
    pub async fn send(&self, message: &ChatMessage) -> Result<serde_json::Value> {
        message.validate()?;
        debug!("Relaying message from {} to {}", message.sender, self.url);

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            error!("Assistant server answered {} to relayed message", status);
            return Err(WardenError::RelayUpstream {
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, err: reqwest::Error) -> WardenError {
        if err.is_timeout() {
            return WardenError::RelayTimeout(self.timeout);
        }
        match io_error_kind(&err) {
            Some(ErrorKind::ConnectionRefused) => WardenError::RelayConnectionRefused,
            Some(ErrorKind::ConnectionReset) => WardenError::RelayConnectionReset,
            _ if err.is_connect() => WardenError::RelayConnectionRefused,
            _ if err.is_decode() => WardenError::Json {
                message: err.to_string(),
                source: None,
            },
            _ => WardenError::from(err),
        }
    }
}

/// Find the first `std::io::Error` in an error's source chain.
fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}{}", addr, RelayConfig::WEBHOOK_PATH)
    }

    fn msg(sender: &str, message: &str) -> ChatMessage {
        ChatMessage {
            sender: sender.into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_validation() {
        assert!(msg("user-1", "hi").validate().is_ok());
        assert!(matches!(
            msg("", "hi").validate(),
            Err(WardenError::Validation { ref field, .. }) if field == "sender"
        ));
        assert!(matches!(
            msg("user-1", "  ").validate(),
            Err(WardenError::Validation { ref field, .. }) if field == "message"
        ));
    }

    #[test]
    fn test_io_error_kind_walks_chain() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped")
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let err = Wrapper(std::io::Error::from(ErrorKind::ConnectionReset));
        assert_eq!(io_error_kind(&err), Some(ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_relay_returns_body_unmodified() {
        let url = serve(Router::new().route(
            RelayConfig::WEBHOOK_PATH,
            post(|Json(body): Json<Value>| async move {
                Json(json!([
                    {"recipient_id": body["sender"], "text": "hello"},
                    {"recipient_id": body["sender"], "custom": {"action": "x"}}
                ]))
            }),
        ))
        .await;

        let relay = MessageRelay::with_url(url, Duration::from_secs(5)).unwrap();
        let reply = relay.send(&msg("user-1", "hi")).await.unwrap();

        assert_eq!(
            reply,
            json!([
                {"recipient_id": "user-1", "text": "hello"},
                {"recipient_id": "user-1", "custom": {"action": "x"}}
            ])
        );
    }

    #[tokio::test]
    async fn test_relay_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let relay = MessageRelay::with_url(
            format!("http://127.0.0.1:{}/webhooks/rest/webhook", port),
            Duration::from_secs(5),
        )
        .unwrap();
        let result = relay.send(&msg("user-1", "hi")).await;
        assert!(matches!(result, Err(WardenError::RelayConnectionRefused)));
    }

    #[tokio::test]
    async fn test_relay_timeout() {
        let url = serve(Router::new().route(
            RelayConfig::WEBHOOK_PATH,
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!([]))
            }),
        ))
        .await;

        let relay = MessageRelay::with_url(url, Duration::from_millis(100)).unwrap();
        let result = relay.send(&msg("user-1", "hi")).await;
        assert!(matches!(result, Err(WardenError::RelayTimeout(_))));
    }

    #[tokio::test]
    async fn test_relay_upstream_error() {
        let url = serve(Router::new().route(
            RelayConfig::WEBHOOK_PATH,
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "loading") }),
        ))
        .await;

        let relay = MessageRelay::with_url(url, Duration::from_secs(5)).unwrap();
        let result = relay.send(&msg("user-1", "hi")).await;
        assert!(matches!(result, Err(WardenError::RelayUpstream { status: 503 })));
    }

    #[tokio::test]
    async fn test_relay_rejects_empty_message_without_network() {
        let relay = MessageRelay::with_url(
            "http://127.0.0.1:9/webhooks/rest/webhook",
            Duration::from_secs(1),
        )
        .unwrap();
        let result = relay.send(&msg("user-1", "")).await;
        assert!(matches!(result, Err(WardenError::Validation { .. })));
    }
}
