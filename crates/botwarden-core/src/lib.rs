//! Botwarden - supervisor for a conversational-AI server.
//!
//! This crate manages the lifecycle of an external assistant server (the
//! primary process) and its custom action server (the auxiliary process):
//! resolving the port, picking the newest trained model, launching,
//! polling readiness and tearing down. It also relays chat messages to the
//! running server. There is no HTTP layer here; see `botwarden-rpc`.
//!
//! # Example
//!
//! ```rust,ignore
//! use botwarden::{ProcessController, SupervisorSettings};
//!
//! #[tokio::main]
//! async fn main() -> botwarden::Result<()> {
//!     let controller = ProcessController::builder(SupervisorSettings::from_env()?).build()?;
//!
//!     let outcome = controller.start().await?;
//!     println!("{}", outcome.message());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod port;
pub mod process;
pub mod relay;

// Re-export commonly used types
pub use config::SupervisorSettings;
pub use error::{Result, WardenError};
pub use logging::{
    read_general_log, read_today_log, DailyFileSink, FanoutSink, LogEvent, LogLevel, LogSink,
    MemorySink, SharedSink, TracingSink,
};
pub use port::{wait_for_port_free, PortProbe, SystemPortProbe};
pub use process::{
    ControllerSnapshot, LifecycleState, ProcessController, Role, ServerStatus, StartOutcome,
    StopOutcome,
};
pub use relay::{ChatMessage, MessageRelay};
