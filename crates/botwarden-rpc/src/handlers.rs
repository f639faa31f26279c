//! HTTP request handlers.

use crate::server::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use botwarden::{read_general_log, read_today_log, ChatMessage, ServerStatus, WardenError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// Default number of events returned by the recent-log endpoint.
const DEFAULT_RECENT_LINES: usize = 100;

/// Error response carrying the failure message and its stable kind tag.
#[derive(Debug)]
pub struct ApiError {
    context: &'static str,
    error: WardenError,
}

impl ApiError {
    fn new(context: &'static str) -> impl FnOnce(WardenError) -> Self {
        move |error| Self { context, error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = format!("{}: {}", self.context, self.error);
        if status.is_server_error() {
            error!("{}", message);
        } else {
            debug!("{}", message);
        }
        (
            status,
            Json(json!({
                "message": message,
                "kind": self.error.kind(),
            })),
        )
            .into_response()
    }
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn handle_start(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .controller
        .start()
        .await
        .map_err(ApiError::new("Error starting assistant server"))?;
    Ok(Json(json!({
        "message": outcome.message(),
        "outcome": outcome,
    })))
}

pub async fn handle_stop(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .controller
        .stop()
        .await
        .map_err(ApiError::new("Error stopping assistant server"))?;
    Ok(Json(json!({
        "message": outcome.message(),
        "outcome": outcome,
    })))
}

pub async fn handle_restart(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .controller
        .restart()
        .await
        .map_err(ApiError::new("Error restarting assistant server"))?;
    Ok(Json(json!({
        "message": outcome.message(),
        "outcome": outcome,
    })))
}

pub async fn handle_status(State(state): State<Arc<AppState>>) -> Json<ServerStatus> {
    Json(state.controller.status().await)
}

/// Chat message body. Missing fields are rejected by validation, not by
/// deserialization, so callers get a 400 with a readable message.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    sender: String,
    #[serde(default)]
    message: String,
}

pub async fn handle_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let message = ChatMessage {
        sender: request.sender,
        message: request.message,
    };
    let reply = state
        .relay
        .send(&message)
        .await
        .map_err(ApiError::new("Error communicating with assistant server"))?;
    Ok(Json(reply))
}

pub async fn handle_today_log(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    read_today_log(&state.log_dir)
        .await
        .map_err(ApiError::new("No log file for today"))
}

pub async fn handle_general_log(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    read_general_log(&state.general_log_dir)
        .await
        .map_err(ApiError::new("No general log file for today"))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    lines: Option<usize>,
}

pub async fn handle_recent_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Value> {
    let events = state
        .recent
        .recent(query.lines.unwrap_or(DEFAULT_RECENT_LINES));
    Json(json!({ "events": events }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use botwarden::logging::{general_log_path, today_log_path};
    use botwarden::{
        LogEvent, LogSink, MemorySink, MessageRelay, ProcessController, SupervisorSettings,
    };
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    struct Fixture {
        _temp_dir: TempDir,
        state: Arc<AppState>,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let port = unused_port();
        let settings = SupervisorSettings::new(temp_dir.path())
            .with_primary_port(port)
            .with_log_dir(temp_dir.path().join("log"))
            .with_general_log_dir(temp_dir.path().join("logs"));

        let recent = Arc::new(MemorySink::new(16));
        let relay = MessageRelay::with_url(settings.webhook_url(), Duration::from_secs(2)).unwrap();
        let log_dir = settings.log_dir.clone();
        let general_log_dir = settings.general_log_dir.clone();
        let controller = ProcessController::builder(settings)
            .log_sink(recent.clone())
            .build()
            .unwrap();

        Fixture {
            _temp_dir: temp_dir,
            state: Arc::new(AppState {
                controller,
                relay,
                recent,
                log_dir,
                general_log_dir,
            }),
        }
    }

    async fn call(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn as_json(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_status_when_stopped() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::GET, "/api/assistant/status", None).await;
        assert_eq!(status, StatusCode::OK);

        let body = as_json(&body);
        assert_eq!(body["running"], false);
        assert_eq!(body["state"], "stopped");
        assert_eq!(body["model_file"], Value::Null);
        assert_eq!(body["num_active_training_jobs"], 0);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_success() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::POST, "/api/assistant/stop", None).await;
        assert_eq!(status, StatusCode::OK);

        let body = as_json(&body);
        assert_eq!(body["message"], "Assistant server is not running");
        assert_eq!(body["outcome"]["outcome"], "not_running");
    }

    #[tokio::test]
    async fn test_start_without_model_fails() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::POST, "/api/assistant/start", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let body = as_json(&body);
        assert_eq!(body["kind"], "no_artifact_found");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("Error starting assistant server"));
        assert!(!f.state.controller.snapshot().is_loading());
    }

    #[tokio::test]
    async fn test_message_validation() {
        let f = fixture();
        let (status, body) = call(
            &f.state,
            Method::POST,
            "/api/assistant/message",
            Some(json!({"sender": "user-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(as_json(&body)["kind"], "validation");
    }

    #[tokio::test]
    async fn test_message_server_down() {
        let f = fixture();
        let (status, body) = call(
            &f.state,
            Method::POST,
            "/api/assistant/message",
            Some(json!({"sender": "user-1", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(as_json(&body)["kind"], "connection_refused");
    }

    #[tokio::test]
    async fn test_today_log() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::GET, "/api/assistant/logs/today", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(as_json(&body)["kind"], "file_not_found");

        std::fs::create_dir_all(&f.state.log_dir).unwrap();
        std::fs::write(today_log_path(&f.state.log_dir), "started\n").unwrap();

        let (status, body) = call(&f.state, Method::GET, "/api/assistant/logs/today", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"started\n");
    }

    #[tokio::test]
    async fn test_general_log() {
        let f = fixture();
        let (status, body) =
            call(&f.state, Method::GET, "/api/assistant/logs/general", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(as_json(&body)["kind"], "file_not_found");

        std::fs::create_dir_all(&f.state.general_log_dir).unwrap();
        std::fs::write(general_log_path(&f.state.general_log_dir), "GET /health\n").unwrap();

        let (status, body) =
            call(&f.state, Method::GET, "/api/assistant/logs/general", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"GET /health\n");
    }

    #[tokio::test]
    async fn test_recent_logs() {
        let f = fixture();
        for i in 0..5 {
            f.state.recent.emit(LogEvent::info(format!("event {}", i)));
        }

        let (status, body) =
            call(&f.state, Method::GET, "/api/assistant/logs/recent?lines=2", None).await;
        assert_eq!(status, StatusCode::OK);

        let events = as_json(&body)["events"].as_array().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["message"], "event 3");
        assert_eq!(events[1]["message"], "event 4");
        assert_eq!(events[1]["level"], "info");
    }
}
