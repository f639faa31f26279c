//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific process handling live here rather
//! than in the controller. The controller only ever sees
//! [`crate::port::PortProbe`].
//!
//! # Supported Platforms
//!
//! - **Linux**: `ss`, falling back to `lsof`
//! - **macOS**: `lsof`
//! - **Windows**: `netstat -ano` and `taskkill`

pub mod process;

pub use process::{find_pids_on_port, is_process_alive, terminate_process_tree};
