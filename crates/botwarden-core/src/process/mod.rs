//! Supervision of the assistant server process pair.
//!
//! The primary process is the conversational server bound to the configured
//! port; the auxiliary process runs custom actions and is started only after
//! the primary reports a loaded model.
//!
//! # Example
//!
//! ```rust,no_run
//! use botwarden::process::ProcessController;
//! use botwarden::SupervisorSettings;
//!
//! #[tokio::main]
//! async fn main() -> botwarden::Result<()> {
//!     let settings = SupervisorSettings::from_env()?;
//!     let controller = ProcessController::builder(settings).build()?;
//!
//!     controller.start().await?;
//!     let status = controller.status().await;
//!     println!("running: {}, model: {:?}", status.running, status.model_file);
//!
//!     controller.stop().await?;
//!     Ok(())
//! }
//! ```

mod artifact;
mod controller;
mod launcher;
mod readiness;

use serde::{Deserialize, Serialize};

pub use artifact::resolve_latest_artifact;
pub use controller::{
    ControllerBuilder, ControllerSnapshot, LifecycleState, ProcessController, RoleStop,
    ServerStatus, StartOutcome, StopOutcome, StopReport, SupervisedProcess,
};
pub use launcher::{ExitReport, LaunchSpec, LaunchedProcess, Launcher, SystemLauncher};
pub use readiness::{
    await_ready, HealthCheck, HealthOutcome, HealthReport, HttpHealthCheck, Readiness,
};

/// Logical role of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Auxiliary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Auxiliary => "auxiliary",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
