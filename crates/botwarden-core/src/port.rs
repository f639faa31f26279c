//! Port probing and forced release.
//!
//! The primary server's port must be proven free right before launch. A
//! probe only answers "is something bound here" and "make it go away"; the
//! polling loop in [`wait_for_port_free`] is the actual gate.

use crate::config::PortConfig;
use crate::error::{Result, WardenError};
use crate::platform;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Port occupancy checks and release.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether something is currently bound to `port`.
    async fn is_port_in_use(&self, port: u16) -> bool;

    /// Terminate whatever holds `port`.
    ///
    /// Returns the PIDs that were terminated. Callers log failures and rely
    /// on a following [`wait_for_port_free`] to decide what happens next.
    async fn free_port(&self, port: u16) -> Result<Vec<u32>>;
}

/// Probe backed by real sockets and the OS process table.
#[derive(Debug, Clone)]
pub struct SystemPortProbe {
    kill_grace_ms: u64,
}

impl SystemPortProbe {
    pub fn new() -> Self {
        Self {
            kill_grace_ms: PortConfig::KILL_GRACE_MS,
        }
    }
}

impl Default for SystemPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortProbe for SystemPortProbe {
    async fn is_port_in_use(&self, port: u16) -> bool {
        // Both wildcard and loopback: on macOS a loopback bind can succeed
        // while the wildcard address is taken.
        for host in ["0.0.0.0", "127.0.0.1"] {
            match tokio::net::TcpListener::bind((host, port)).await {
                Ok(listener) => drop(listener),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!("Port {} is in use ({})", port, host);
                    return true;
                }
                Err(e) => {
                    // Only address-in-use counts as occupied.
                    debug!("Bind probe on {}:{} failed: {}", host, port, e);
                }
            }
        }
        debug!("Port {} is free", port);
        false
    }

    async fn free_port(&self, port: u16) -> Result<Vec<u32>> {
        let grace = self.kill_grace_ms;
        let own_pid = std::process::id();

        tokio::task::spawn_blocking(move || {
            let pids = platform::find_pids_on_port(port)?;
            if pids.is_empty() {
                debug!("No process found listening on port {}", port);
                return Ok(Vec::new());
            }

            let mut terminated = Vec::new();
            let mut failures = Vec::new();
            for pid in pids {
                if pid == own_pid {
                    warn!("Refusing to terminate own process {} on port {}", pid, port);
                    continue;
                }
                info!("Terminating process {} holding port {}", pid, port);
                match platform::terminate_process_tree(pid, grace) {
                    Ok(true) => terminated.push(pid),
                    Ok(false) => failures.push(format!("{} survived termination", pid)),
                    Err(e) => failures.push(format!("{}: {}", pid, e)),
                }
            }

            if failures.is_empty() {
                Ok(terminated)
            } else {
                Err(WardenError::Other(format!(
                    "failed to free port {}: {}",
                    port,
                    failures.join("; ")
                )))
            }
        })
        .await
        .map_err(|e| WardenError::Other(format!("Task join error: {}", e)))?
    }
}

/// Poll until `port` is free or `timeout` has elapsed.
///
/// Returns `false` on timeout; the caller decides what that means.
pub async fn wait_for_port_free(
    probe: &dyn PortProbe,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let start = Instant::now();
    loop {
        if !probe.is_port_in_use(port).await {
            return true;
        }
        if start.elapsed() >= timeout {
            warn!("Port {} still in use after {:?}", port, timeout);
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports busy for the first `busy_polls` probes.
    struct CountdownProbe {
        busy_polls: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl PortProbe for CountdownProbe {
        async fn is_port_in_use(&self, _port: u16) -> bool {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            n < self.busy_polls
        }

        async fn free_port(&self, _port: u16) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_bound_port_is_in_use() {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = SystemPortProbe::new();

        assert!(probe.is_port_in_use(port).await);

        drop(listener);
        assert!(!probe.is_port_in_use(port).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_port_free_succeeds() {
        let probe = CountdownProbe {
            busy_polls: 3,
            polls: AtomicU32::new(0),
        };
        let free = wait_for_port_free(
            &probe,
            5005,
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await;

        assert!(free);
        assert_eq!(probe.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_port_free_times_out() {
        let probe = CountdownProbe {
            busy_polls: u32::MAX,
            polls: AtomicU32::new(0),
        };
        let start = Instant::now();
        let free = wait_for_port_free(
            &probe,
            5005,
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await;

        assert!(!free);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_free_port_with_nothing_listening() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // Either nothing is found, or no lookup tool exists on this host.
        if let Ok(pids) = SystemPortProbe::new().free_port(port).await {
            assert!(pids.is_empty());
        }
    }
}
