//! Readiness polling against the primary server's health endpoint.
//!
//! Liveness (a process handle exists) and readiness (the server answers
//! with a loaded model) are separate signals: a freshly spawned server can
//! be alive for minutes before its model is loaded.

use crate::config::ReadinessConfig;
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata reported by a ready server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub model_file: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub num_active_training_jobs: u64,
}

/// Result of a single health request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The server answered with a loaded model.
    Ready(HealthReport),
    /// The server answered, but without the readiness marker.
    NotReady(String),
    /// The request did not complete within its timeout.
    TimedOut,
    /// Connection failure or other transport error.
    Unreachable(String),
}

/// One-shot health query against the primary server.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, timeout: Duration) -> HealthOutcome;
}

/// Health check issuing `GET` against the server's status endpoint.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthCheck {
    /// Create a health check for a full status URL such as
    /// `http://localhost:5005/status`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url).map_err(|e| WardenError::Config {
            message: format!("invalid health URL '{}': {}", url, e),
        })?;

        let client = reqwest::Client::builder()
            .user_agent("botwarden")
            .build()
            .map_err(|e| WardenError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, timeout: Duration) -> HealthOutcome {
        debug!("Health check: {}", self.url);

        let response = match self.client.get(&self.url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return HealthOutcome::TimedOut,
            Err(e) => return HealthOutcome::Unreachable(e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return HealthOutcome::NotReady(format!("health endpoint returned {}", status));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) if e.is_timeout() => return HealthOutcome::TimedOut,
            Err(e) => return HealthOutcome::NotReady(format!("unreadable health body: {}", e)),
        };

        parse_health_body(&body)
    }
}

/// Interpret a health response body.
///
/// A non-empty `model_file` string is the readiness marker.
pub(crate) fn parse_health_body(body: &serde_json::Value) -> HealthOutcome {
    let marker = body
        .get(ReadinessConfig::READY_MARKER)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());

    match marker {
        Some(model_file) => HealthOutcome::Ready(HealthReport {
            model_file: model_file.to_string(),
            model_id: body
                .get("model_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            num_active_training_jobs: body
                .get("num_active_training_jobs")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        }),
        None => HealthOutcome::NotReady("no model loaded".to_string()),
    }
}

/// Outcome of a readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready(HealthReport),
    TimedOut { attempts: u32 },
}

/// Poll `check` until it reports ready or `max_attempts` polls have failed.
///
/// Individual failures are only logged. The delay sits between attempts,
/// never after the last one.
pub async fn await_ready(
    check: &dyn HealthCheck,
    max_attempts: u32,
    interval: Duration,
    request_timeout: Duration,
) -> Readiness {
    for attempt in 1..=max_attempts {
        match check.check(request_timeout).await {
            HealthOutcome::Ready(report) => {
                info!(
                    "Server ready after {} attempt(s), model: {}",
                    attempt, report.model_file
                );
                return Readiness::Ready(report);
            }
            HealthOutcome::NotReady(reason) | HealthOutcome::Unreachable(reason) => {
                debug!("Readiness attempt {}/{}: {}", attempt, max_attempts, reason);
            }
            HealthOutcome::TimedOut => {
                debug!("Readiness attempt {}/{}: timed out", attempt, max_attempts);
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }

    warn!("Server not ready after {} attempts", max_attempts);
    Readiness::TimedOut {
        attempts: max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports ready on the `ready_on`-th call, never if `None`.
    struct ScriptedCheck {
        ready_on: Option<u32>,
        calls: AtomicU32,
    }

    impl ScriptedCheck {
        fn new(ready_on: Option<u32>) -> Self {
            Self {
                ready_on,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthCheck for ScriptedCheck {
        async fn check(&self, _timeout: Duration) -> HealthOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(call) == self.ready_on {
                HealthOutcome::Ready(HealthReport {
                    model_file: "20240101-000000.tar.gz".into(),
                    model_id: None,
                    num_active_training_jobs: 0,
                })
            } else {
                HealthOutcome::Unreachable("connection refused".into())
            }
        }
    }

    #[tokio::test]
    async fn test_times_out_after_exact_attempts() {
        let check = ScriptedCheck::new(None);
        let result = await_ready(
            &check,
            3,
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(result, Readiness::TimedOut { attempts: 3 });
        assert_eq!(check.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_polling_once_ready() {
        let check = ScriptedCheck::new(Some(2));
        let result = await_ready(&check, 30, Duration::from_secs(5), Duration::from_secs(3)).await;

        assert!(matches!(result, Readiness::Ready(_)));
        assert_eq!(check.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parse_health_body() {
        let ready = parse_health_body(&json!({
            "model_file": "models/20240101.tar.gz",
            "model_id": "abc",
            "num_active_training_jobs": 2
        }));
        assert_eq!(
            ready,
            HealthOutcome::Ready(HealthReport {
                model_file: "models/20240101.tar.gz".into(),
                model_id: Some("abc".into()),
                num_active_training_jobs: 2,
            })
        );

        assert!(matches!(
            parse_health_body(&json!({"status": "ok"})),
            HealthOutcome::NotReady(_)
        ));
        assert!(matches!(
            parse_health_body(&json!({"model_file": ""})),
            HealthOutcome::NotReady(_)
        ));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_check_ready() {
        let base = serve(Router::new().route(
            "/status",
            get(|| async { Json(json!({"model_file": "m.tar.gz", "model_id": "1"})) }),
        ))
        .await;

        let check = HttpHealthCheck::new(format!("{}/status", base)).unwrap();
        let outcome = check.check(Duration::from_secs(5)).await;
        assert!(matches!(outcome, HealthOutcome::Ready(ref r) if r.model_file == "m.tar.gz"));
    }

    #[tokio::test]
    async fn test_http_check_slow_server_times_out() {
        let base = serve(Router::new().route(
            "/status",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"model_file": "m.tar.gz"}))
            }),
        ))
        .await;

        let check = HttpHealthCheck::new(format!("{}/status", base)).unwrap();
        let outcome = check.check(Duration::from_millis(100)).await;
        assert_eq!(outcome, HealthOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_http_check_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let check = HttpHealthCheck::new(format!("http://127.0.0.1:{}/status", port)).unwrap();
        let outcome = check.check(Duration::from_secs(2)).await;
        assert!(matches!(outcome, HealthOutcome::Unreachable(_)));
    }
}
