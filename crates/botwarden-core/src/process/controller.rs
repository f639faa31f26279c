//! Lifecycle controller for the primary/auxiliary process pair.
//!
//! # State machine
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               |
//!               +--> Stopped   (port unavailable, no artifact, launch
//!                               failure, readiness timeout)
//! ```
//!
//! `Starting` doubles as the mutual-exclusion flag: while it is set, further
//! `start` and `stop` calls return no-op outcomes instead of queueing. The
//! state lock is a plain mutex and is never held across an `.await`.

use super::artifact::resolve_latest_artifact;
use super::launcher::{ExitReport, LaunchSpec, LaunchedProcess, Launcher, SystemLauncher};
use super::readiness::{await_ready, HealthCheck, HealthOutcome, HttpHealthCheck, Readiness};
use super::Role;
use crate::config::SupervisorSettings;
use crate::error::{Result, WardenError};
use crate::logging::{LogEvent, LogLevel, SharedSink, TracingSink};
use crate::port::{wait_for_port_free, PortProbe, SystemPortProbe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A process currently owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisedProcess {
    pub role: Role,
    /// Monotonic per-controller launch counter.
    pub instance: u64,
    pub pid: Option<u32>,
    pub port: u16,
    /// Model artifact served (primary only).
    pub artifact: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

/// Read-only copy of the controller state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerSnapshot {
    pub state: LifecycleState,
    pub primary: Option<SupervisedProcess>,
    pub auxiliary: Option<SupervisedProcess>,
}

impl ControllerSnapshot {
    /// Primary handle present and start sequence complete.
    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// Start sequence in progress.
    pub fn is_loading(&self) -> bool {
        self.state == LifecycleState::Starting
    }

    pub fn auxiliary_running(&self) -> bool {
        self.auxiliary.is_some()
    }
}

/// Result of [`ProcessController::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started {
        primary: SupervisedProcess,
        auxiliary: SupervisedProcess,
    },
    /// No-op: a start is in progress or the server already runs.
    AlreadyActive { state: LifecycleState },
}

impl StartOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, StartOutcome::AlreadyActive { .. })
    }

    pub fn message(&self) -> String {
        match self {
            StartOutcome::Started { primary, .. } => format!(
                "Assistant server started on port {} with model {}",
                primary.port,
                primary
                    .artifact
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
            StartOutcome::AlreadyActive { state } => {
                format!("Assistant server is already {}", state)
            }
        }
    }
}

/// Per-role result of a stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RoleStop {
    Stopped { pids: Vec<u32> },
    NotRunning,
    Failed { message: String },
}

/// What a stop did to each role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub primary: RoleStop,
    pub auxiliary: RoleStop,
}

/// Result of [`ProcessController::stop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { report: StopReport },
    /// No-op: loading or another stop is in progress.
    Busy { state: LifecycleState },
    /// No-op: nothing to stop.
    NotRunning,
}

impl StopOutcome {
    pub fn is_noop(&self) -> bool {
        !matches!(self, StopOutcome::Stopped { .. })
    }

    pub fn message(&self) -> String {
        match self {
            StopOutcome::Stopped { .. } => "Assistant server stopped".to_string(),
            StopOutcome::Busy { state } => {
                format!("Assistant server is {}, cannot stop now", state)
            }
            StopOutcome::NotRunning => "Assistant server is not running".to_string(),
        }
    }
}

/// Status document returned by [`ProcessController::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    /// Observed state: `running`, `starting` or `stopped`.
    pub state: LifecycleState,
    pub model_file: Option<String>,
    pub model_id: Option<String>,
    pub num_active_training_jobs: u64,
    /// Controller's own lifecycle state.
    pub lifecycle: LifecycleState,
    pub auxiliary_running: bool,
    pub primary_pid: Option<u32>,
    pub auxiliary_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerStatus {
    fn base(snapshot: &ControllerSnapshot, state: LifecycleState) -> Self {
        Self {
            running: state == LifecycleState::Running,
            state,
            model_file: None,
            model_id: None,
            num_active_training_jobs: 0,
            lifecycle: snapshot.state,
            auxiliary_running: snapshot.auxiliary_running(),
            primary_pid: snapshot.primary.as_ref().and_then(|p| p.pid),
            auxiliary_pid: snapshot.auxiliary.as_ref().and_then(|p| p.pid),
            error: None,
            message: None,
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    lifecycle: LifecycleState,
    primary: Option<SupervisedProcess>,
    auxiliary: Option<SupervisedProcess>,
    next_instance: u64,
}

impl ControllerState {
    fn slot(&mut self, role: Role) -> &mut Option<SupervisedProcess> {
        match role {
            Role::Primary => &mut self.primary,
            Role::Auxiliary => &mut self.auxiliary,
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.lifecycle,
            primary: self.primary.clone(),
            auxiliary: self.auxiliary.clone(),
        }
    }
}

fn lock_state(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builder for [`ProcessController`].
///
/// Every collaborator defaults to its system implementation.
pub struct ControllerBuilder {
    settings: SupervisorSettings,
    ports: Option<Arc<dyn PortProbe>>,
    launcher: Option<Arc<dyn Launcher>>,
    health: Option<Arc<dyn HealthCheck>>,
    sink: Option<SharedSink>,
}

impl ControllerBuilder {
    pub fn port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.ports = Some(probe);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn log_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<ProcessController> {
        let sink: SharedSink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let health: Arc<dyn HealthCheck> = match self.health {
            Some(h) => h,
            None => Arc::new(HttpHealthCheck::new(self.settings.health_url())?),
        };
        let launcher: Arc<dyn Launcher> = self
            .launcher
            .unwrap_or_else(|| Arc::new(SystemLauncher::new(sink.clone())));
        let ports: Arc<dyn PortProbe> = self
            .ports
            .unwrap_or_else(|| Arc::new(SystemPortProbe::new()));

        Ok(ProcessController {
            settings: self.settings,
            ports,
            launcher,
            health,
            sink,
            state: Arc::new(Mutex::new(ControllerState {
                lifecycle: LifecycleState::Stopped,
                primary: None,
                auxiliary: None,
                next_instance: 0,
            })),
        })
    }
}

/// Supervisor for the primary server and its auxiliary action server.
pub struct ProcessController {
    settings: SupervisorSettings,
    ports: Arc<dyn PortProbe>,
    launcher: Arc<dyn Launcher>,
    health: Arc<dyn HealthCheck>,
    sink: SharedSink,
    state: Arc<Mutex<ControllerState>>,
}

impl ProcessController {
    pub fn builder(settings: SupervisorSettings) -> ControllerBuilder {
        ControllerBuilder {
            settings,
            ports: None,
            launcher: None,
            health: None,
            sink: None,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ControllerSnapshot {
        lock_state(&self.state).snapshot()
    }

    /// Start the primary server, wait for readiness, then start the auxiliary.
    ///
    /// Returns [`StartOutcome::AlreadyActive`] without side effects when a
    /// start is in progress or the server is already up. On failure the
    /// state returns to `Stopped`; processes that were already spawned are
    /// left for [`stop`](Self::stop) or their exit observers.
    pub async fn start(&self) -> Result<StartOutcome> {
        {
            let mut state = lock_state(&self.state);
            if state.lifecycle != LifecycleState::Stopped {
                let current = state.lifecycle;
                drop(state);
                self.log(
                    LogLevel::Warn,
                    format!("Assistant server is already {}; start ignored", current),
                );
                return Ok(StartOutcome::AlreadyActive { state: current });
            }
            state.lifecycle = LifecycleState::Starting;
        }

        match self.start_sequence().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                lock_state(&self.state).lifecycle = LifecycleState::Stopped;
                self.log(
                    LogLevel::Error,
                    format!("Failed to start assistant server: {}", e),
                );
                Err(e)
            }
        }
    }

    async fn start_sequence(&self) -> Result<StartOutcome> {
        let port = self.settings.primary_port;
        self.ensure_port_free(port).await?;

        let artifact =
            resolve_latest_artifact(&self.settings.artifact_dir, &self.settings.artifact_suffix)?;
        self.log(
            LogLevel::Info,
            format!(
                "Starting assistant server on port {} with model {}",
                port,
                artifact.display()
            ),
        );

        let spec = LaunchSpec::primary(&self.settings, &artifact);
        let launched = self.launcher.launch(Role::Primary, &spec).await?;
        let primary = self.register(Role::Primary, port, Some(artifact), launched);

        self.log(
            LogLevel::Info,
            format!("Waiting for assistant server on port {} to become ready", port),
        );
        match await_ready(
            self.health.as_ref(),
            self.settings.readiness_attempts,
            self.settings.readiness_interval,
            self.settings.readiness_request_timeout,
        )
        .await
        {
            Readiness::Ready(report) => self.log(
                LogLevel::Info,
                format!(
                    "Assistant server is online on port {} (model {})",
                    port, report.model_file
                ),
            ),
            Readiness::TimedOut { attempts } => {
                return Err(WardenError::ReadinessTimeout { attempts });
            }
        }

        let aux_port = self.settings.auxiliary_port;
        self.ensure_port_free(aux_port).await?;
        let spec = LaunchSpec::auxiliary(&self.settings);
        let launched = self.launcher.launch(Role::Auxiliary, &spec).await?;
        let auxiliary = self.register(Role::Auxiliary, aux_port, None, launched);

        let mut state = lock_state(&self.state);
        if state.primary.as_ref().map(|p| p.instance) != Some(primary.instance) {
            return Err(WardenError::LaunchFailed {
                role: Role::Primary,
                message: "process exited before startup completed".to_string(),
            });
        }
        state.lifecycle = LifecycleState::Running;
        drop(state);

        self.log(
            LogLevel::Info,
            format!(
                "Assistant server running on port {}, action server on port {}",
                port, aux_port
            ),
        );
        Ok(StartOutcome::Started { primary, auxiliary })
    }

    /// Make sure `port` is free, terminating its holder if needed.
    async fn ensure_port_free(&self, port: u16) -> Result<()> {
        if !self.ports.is_port_in_use(port).await {
            return Ok(());
        }

        self.log(
            LogLevel::Warn,
            format!("Port {} is in use; stopping the process holding it", port),
        );
        match self.ports.free_port(port).await {
            Ok(pids) => debug!("Terminated {:?} on port {}", pids, port),
            Err(e) => self.log(LogLevel::Warn, format!("Could not free port {}: {}", port, e)),
        }

        if wait_for_port_free(
            self.ports.as_ref(),
            port,
            self.settings.port_free_timeout,
            self.settings.port_poll_interval,
        )
        .await
        {
            Ok(())
        } else {
            Err(WardenError::PortUnavailable { port })
        }
    }

    /// Record a launched process and attach its exit observer.
    fn register(
        &self,
        role: Role,
        port: u16,
        artifact: Option<PathBuf>,
        launched: LaunchedProcess,
    ) -> SupervisedProcess {
        let process = {
            let mut state = lock_state(&self.state);
            state.next_instance += 1;
            let process = SupervisedProcess {
                role,
                instance: state.next_instance,
                pid: launched.pid,
                port,
                artifact,
                started_at: Utc::now(),
            };
            *state.slot(role) = Some(process.clone());
            process
        };

        self.watch_exit(role, process.instance, launched.exited);
        process
    }

    /// Clear the handle for `instance` once its process exits.
    ///
    /// This is the only way the controller learns about a crash. Handles
    /// taken by [`stop`](Self::stop) no longer match, so deliberate exits
    /// stay silent.
    fn watch_exit(&self, role: Role, instance: u64, exited: oneshot::Receiver<ExitReport>) {
        let state = Arc::clone(&self.state);
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let report = exited.await.unwrap_or_default();

            let mut guard = lock_state(&state);
            let slot = guard.slot(role);
            if slot.as_ref().map(|p| p.instance) != Some(instance) {
                // Already stopped or replaced.
                return;
            }
            *slot = None;
            if role == Role::Primary && guard.lifecycle == LifecycleState::Running {
                guard.lifecycle = LifecycleState::Stopped;
            }
            drop(guard);

            sink.emit(LogEvent::warn(format!(
                "{} process exited unexpectedly ({}); marked as not running",
                role, report
            )));
        });
    }

    /// Stop both processes, primary first.
    ///
    /// A no-op while loading or when nothing runs. Each role is attempted
    /// regardless of how the other fared.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let (primary, auxiliary) = {
            let mut state = lock_state(&self.state);
            let current = state.lifecycle;
            match current {
                LifecycleState::Starting | LifecycleState::Stopping => {
                    drop(state);
                    self.log(
                        LogLevel::Warn,
                        format!("Assistant server is {}, cannot stop now", current),
                    );
                    return Ok(StopOutcome::Busy { state: current });
                }
                LifecycleState::Stopped if state.primary.is_none() && state.auxiliary.is_none() => {
                    drop(state);
                    self.log(LogLevel::Info, "Assistant server is not running");
                    return Ok(StopOutcome::NotRunning);
                }
                _ => {}
            }
            state.lifecycle = LifecycleState::Stopping;
            // Taking the handles detaches the exit observers: the exits
            // caused below are not reported as crashes.
            (state.primary.take(), state.auxiliary.take())
        };

        let primary = self.stop_role(Role::Primary, primary).await;
        let auxiliary = self.stop_role(Role::Auxiliary, auxiliary).await;

        lock_state(&self.state).lifecycle = LifecycleState::Stopped;

        Ok(StopOutcome::Stopped {
            report: StopReport { primary, auxiliary },
        })
    }

    async fn stop_role(&self, role: Role, process: Option<SupervisedProcess>) -> RoleStop {
        let Some(process) = process else {
            self.log(LogLevel::Info, format!("{} process is not running", role));
            return RoleStop::NotRunning;
        };

        self.log(
            LogLevel::Info,
            format!("Stopping {} process on port {}", role, process.port),
        );

        let mut failures = Vec::new();
        let mut pids = match self.ports.free_port(process.port).await {
            Ok(pids) => pids,
            Err(e) => {
                failures.push(e.to_string());
                Vec::new()
            }
        };

        // The process may never have bound its port.
        if let Some(pid) = process.pid.filter(|pid| !pids.contains(pid)) {
            match self.launcher.terminate(pid).await {
                Ok(true) => pids.push(pid),
                Ok(false) => failures.push(format!("process {} survived termination", pid)),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            self.log(
                LogLevel::Info,
                format!("{} process on port {} stopped", role, process.port),
            );
            RoleStop::Stopped { pids }
        } else {
            let message = failures.join("; ");
            self.log(
                LogLevel::Error,
                format!("Failed to stop {} process: {}", role, message),
            );
            RoleStop::Failed { message }
        }
    }

    /// Stop, let the port settle, then start again.
    pub async fn restart(&self) -> Result<StartOutcome> {
        let port = self.settings.primary_port;
        self.log(
            LogLevel::Info,
            format!("Restarting assistant server on port {}", port),
        );

        if let StopOutcome::Busy { state } = self.stop().await? {
            return Err(WardenError::RestartAborted {
                port,
                reason: format!("server is {}", state),
            });
        }

        tokio::time::sleep(self.settings.restart_settle).await;

        if !wait_for_port_free(
            self.ports.as_ref(),
            port,
            self.settings.port_free_timeout,
            self.settings.port_poll_interval,
        )
        .await
        {
            self.log(
                LogLevel::Error,
                format!("Cannot restart: port {} is still in use", port),
            );
            return Err(WardenError::RestartAborted {
                port,
                reason: "port is still in use".to_string(),
            });
        }

        self.start().await
    }

    /// Report liveness and readiness without touching controller state.
    ///
    /// No primary handle means `stopped` with no network call. Otherwise a
    /// single health request decides: a loaded model is `running`, a timeout
    /// is `starting`, anything else is `stopped` with the error attached.
    pub async fn status(&self) -> ServerStatus {
        let snapshot = self.snapshot();
        if snapshot.primary.is_none() {
            let mut status = ServerStatus::base(&snapshot, LifecycleState::Stopped);
            status.message = Some("Assistant server is not running".to_string());
            return status;
        }

        match self.health.check(self.settings.status_timeout).await {
            HealthOutcome::Ready(report) => {
                let mut status = ServerStatus::base(&snapshot, LifecycleState::Running);
                status.model_file = Some(report.model_file);
                status.model_id = Some(report.model_id.unwrap_or_else(|| "unknown".to_string()));
                status.num_active_training_jobs = report.num_active_training_jobs;
                status
            }
            HealthOutcome::TimedOut => {
                let mut status = ServerStatus::base(&snapshot, LifecycleState::Starting);
                status.message = Some("Assistant server is still loading".to_string());
                status
            }
            HealthOutcome::NotReady(reason) | HealthOutcome::Unreachable(reason) => {
                let mut status = ServerStatus::base(&snapshot, LifecycleState::Stopped);
                status.error = Some(reason);
                status
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.emit(LogEvent::new(level, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_messages() {
        let noop = StartOutcome::AlreadyActive {
            state: LifecycleState::Running,
        };
        assert!(noop.is_noop());
        assert_eq!(noop.message(), "Assistant server is already running");

        let busy = StopOutcome::Busy {
            state: LifecycleState::Starting,
        };
        assert!(busy.is_noop());
        assert_eq!(busy.message(), "Assistant server is starting, cannot stop now");
        assert!(StopOutcome::NotRunning.is_noop());
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(StopOutcome::NotRunning).unwrap();
        assert_eq!(value["outcome"], "not_running");

        let value = serde_json::to_value(StartOutcome::AlreadyActive {
            state: LifecycleState::Starting,
        })
        .unwrap();
        assert_eq!(value["outcome"], "already_active");
        assert_eq!(value["state"], "starting");
    }

    #[test]
    fn test_snapshot_flags_exclusive() {
        for state in [
            LifecycleState::Stopped,
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Stopping,
        ] {
            let snapshot = ControllerSnapshot {
                state,
                primary: None,
                auxiliary: None,
            };
            assert!(!(snapshot.is_running() && snapshot.is_loading()));
        }
    }
}
