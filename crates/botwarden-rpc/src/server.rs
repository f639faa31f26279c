//! HTTP server implementation using Axum.

use crate::handlers::{
    handle_general_log, handle_health, handle_message, handle_recent_logs, handle_restart,
    handle_start, handle_status, handle_stop, handle_today_log,
};
use axum::{
    routing::{get, post},
    Router,
};
use botwarden::{
    DailyFileSink, FanoutSink, MemorySink, MessageRelay, ProcessController, SharedSink,
    SupervisorSettings, TracingSink,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Upper bound on requests handled at once.
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Application state shared across handlers.
pub struct AppState {
    /// Supervisor for the assistant server pair
    pub controller: ProcessController,
    /// Webhook client for chat messages
    pub relay: MessageRelay,
    /// In-memory tail of supervisor events
    pub recent: Arc<MemorySink>,
    /// Directory holding the daily log files
    pub log_dir: PathBuf,
    /// Directory holding the host server's own logs
    pub general_log_dir: PathBuf,
}

impl AppState {
    /// Build the state with system collaborators.
    ///
    /// Supervisor events go to tracing, to today's log file and to the
    /// in-memory tail. Must be called inside a Tokio runtime.
    pub fn new(settings: SupervisorSettings) -> botwarden::Result<Self> {
        let recent = Arc::new(MemorySink::default());
        let sink: SharedSink = Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(Arc::new(DailyFileSink::new(&settings.log_dir)))
                .with(recent.clone()),
        );

        let relay = MessageRelay::new(&settings)?;
        let log_dir = settings.log_dir.clone();
        let general_log_dir = settings.general_log_dir.clone();
        let controller = ProcessController::builder(settings)
            .log_sink(sink)
            .build()?;

        Ok(Self {
            controller,
            relay,
            recent,
            log_dir,
            general_log_dir,
        })
    }
}

/// Build the router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    // Configure CORS for the browser dashboard
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let assistant = Router::new()
        .route("/start", post(handle_start))
        .route("/stop", post(handle_stop))
        .route("/restart", post(handle_restart))
        .route("/status", get(handle_status))
        .route("/message", post(handle_message))
        .route("/logs/today", get(handle_today_log))
        .route("/logs/general", get(handle_general_log))
        .route("/logs/recent", get(handle_recent_logs));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api/assistant", assistant)
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_starts() {
        let temp_dir = TempDir::new().unwrap();
        let settings = SupervisorSettings::new(temp_dir.path());
        let state = Arc::new(AppState::new(settings).unwrap());

        let addr = start_server(state, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_invalid_host_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let settings = SupervisorSettings::new(temp_dir.path());
        let state = Arc::new(AppState::new(settings).unwrap());

        assert!(start_server(state, "not a host", 0).await.is_err());
    }
}
