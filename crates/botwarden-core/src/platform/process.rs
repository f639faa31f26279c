//! Platform-specific process management.
//!
//! Liveness checks, forced termination, and the process-table lookup that
//! maps a listening TCP port back to the PIDs holding it. Every function
//! here is blocking; async callers go through `spawn_blocking`.

use crate::error::{Result, WardenError};
#[cfg(any(target_os = "linux", target_os = "macos", windows, test))]
use std::collections::BTreeSet;
#[cfg(any(target_os = "linux", target_os = "macos", windows))]
use std::process::Command;
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
/// - **Windows**: `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        windows_alive(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        let _ = pid;
        true
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn windows_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    // SAFETY: OpenProcess takes plain integer arguments and returns a null
    // handle on failure. A non-null handle is closed exactly once below.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

/// Terminate a process, escalating to a forced kill.
///
/// # Platform Behavior
/// - **Linux/macOS**: SIGTERM, wait up to `timeout_ms`, then SIGKILL
/// - **Windows**: `taskkill /PID {pid} /F /T`
///
/// Returns `true` if the process is gone afterwards (or was never running).
pub fn terminate_process_tree(pid: u32, timeout_ms: u64) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        terminate_unix(pid, timeout_ms)
    }

    #[cfg(windows)]
    {
        let _ = timeout_ms;
        terminate_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = timeout_ms;
        Err(WardenError::Other(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn terminate_unix(pid: u32, timeout_ms: u64) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use std::thread::sleep;
    use std::time::Duration;

    let raw = i32::try_from(pid)
        .map_err(|_| WardenError::Other(format!("PID {} out of range", pid)))?;
    let nix_pid = Pid::from_raw(raw);

    debug!("Sending SIGTERM to process {}", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (timeout_ms / 100).max(1);

    for _ in 0..iterations {
        sleep(wait_interval);
        // Reap if it is our own child; ECHILD otherwise, which is fine.
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!("Process {} terminated gracefully", pid);
            return Ok(true);
        }
    }

    debug!("Process {} still running, sending SIGKILL", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        return Err(WardenError::Other(format!(
            "Failed to kill process {}: {}",
            pid, e
        )));
    }

    sleep(Duration::from_millis(100));
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!("Reaped process {}: {:?}", pid, status),
        Err(e) if e != Errno::ECHILD => debug!("waitpid({}) failed: {}", pid, e),
        Err(_) => {}
    }

    Ok(!is_process_alive(pid))
}

#[cfg(windows)]
fn terminate_windows(pid: u32) -> Result<bool> {
    debug!("Terminating process {} with taskkill", pid);

    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .output()
        .map_err(|e| WardenError::Other(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        return Ok(true);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("not found") || stderr.contains("not running") {
        Ok(true)
    } else {
        warn!("taskkill failed for {}: {}", pid, stderr);
        Ok(false)
    }
}

/// Find the PIDs of processes listening on a TCP port.
///
/// # Platform Behavior
/// - **Linux**: `ss -tlnp`, then `lsof` for anything `ss` could not attribute
/// - **macOS**: `lsof -t -iTCP:{port} -sTCP:LISTEN`
/// - **Windows**: `netstat -ano -p tcp`
///
/// Returns an error only when no lookup tool could be run at all.
pub fn find_pids_on_port(port: u16) -> Result<Vec<u32>> {
    #[cfg(target_os = "linux")]
    {
        let mut pids: BTreeSet<u32> = BTreeSet::new();
        let ss = run_tool("ss", &["-tlnp".to_string(), format!("sport = :{}", port)]);
        let lsof = run_tool("lsof", &lsof_args(port));

        if ss.is_none() && lsof.is_none() {
            return Err(WardenError::Other(
                "neither ss nor lsof is available to look up port owners".into(),
            ));
        }
        if let Some(out) = ss {
            pids.extend(parse_ss_pids(&out));
        }
        if let Some(out) = lsof {
            pids.extend(parse_lsof_pids(&out));
        }
        Ok(pids.into_iter().collect())
    }

    #[cfg(target_os = "macos")]
    {
        let out = run_tool("lsof", &lsof_args(port))
            .ok_or_else(|| WardenError::Other("lsof is not available".into()))?;
        Ok(parse_lsof_pids(&out).into_iter().collect())
    }

    #[cfg(windows)]
    {
        let args = ["-ano".to_string(), "-p".to_string(), "tcp".to_string()];
        let out = run_tool("netstat", &args)
            .ok_or_else(|| WardenError::Other("netstat is not available".into()))?;
        Ok(parse_netstat_pids(&out, port).into_iter().collect())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = port;
        Err(WardenError::Other(
            "port owner lookup not implemented for this platform".into(),
        ))
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn lsof_args(port: u16) -> Vec<String> {
    vec![
        "-t".to_string(),
        format!("-iTCP:{}", port),
        "-sTCP:LISTEN".to_string(),
    ]
}

/// Run a lookup tool; `None` if it could not be started.
///
/// A non-zero exit with empty output is treated as "no matches", which is
/// how `lsof` reports an unused port.
#[cfg(any(target_os = "linux", target_os = "macos", windows))]
fn run_tool(program: &str, args: &[String]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Err(e) => {
            debug!("Failed to run {}: {}", program, e);
            None
        }
    }
}

/// Extract `pid=N` entries from `ss -tlnp` output.
#[cfg(any(target_os = "linux", test))]
fn parse_ss_pids(output: &str) -> BTreeSet<u32> {
    let mut pids = BTreeSet::new();
    for line in output.lines().skip(1) {
        for part in line.split(|c: char| c == ',' || c.is_whitespace()) {
            if let Some(pid) = part.strip_prefix("pid=").and_then(|p| p.parse().ok()) {
                pids.insert(pid);
            }
        }
    }
    pids
}

/// Parse `lsof -t` output: one PID per line.
#[cfg(any(target_os = "linux", target_os = "macos", test))]
fn parse_lsof_pids(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Parse `netstat -ano` rows whose local address ends in `:{port}` and which
/// are listening.
#[cfg(any(windows, test))]
fn parse_netstat_pids(output: &str, port: u16) -> BTreeSet<u32> {
    let suffix = format!(":{}", port);
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            cols[4].parse::<u32>().ok()
        })
        .filter(|pid| *pid != 0)
        .collect()
}
