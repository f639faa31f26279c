//! Process launching.

use super::Role;
use crate::config::{PortConfig, SupervisorSettings};
use crate::error::{Result, WardenError};
use crate::logging::{LogEvent, SharedSink};
use crate::platform;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// What to run for a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Environment variables added on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Spec for the primary server, serving `artifact` on the primary port.
    pub fn primary(settings: &SupervisorSettings, artifact: &Path) -> Self {
        Self::new(&settings.python)
            .with_args(["-m", "rasa", "run", "--model"])
            .with_arg(artifact.to_string_lossy())
            .with_arg("--enable-api")
            .with_arg("--port")
            .with_arg(settings.primary_port.to_string())
            .with_arg("--endpoints")
            .with_arg(settings.endpoints_file.to_string_lossy())
    }

    /// Spec for the auxiliary action server.
    pub fn auxiliary(settings: &SupervisorSettings) -> Self {
        let project_dir = settings.project_dir.to_string_lossy().into_owned();
        Self::new(&settings.python)
            .with_args(["-m", "rasa", "run", "actions", "--port"])
            .with_arg(settings.auxiliary_port.to_string())
            .with_cwd(&settings.project_dir)
            .with_env("PYTHONPATH", project_dir)
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Program and arguments joined for display.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let signal = self
            .signal
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(f, "code {}, signal {}", code, signal)
    }
}

/// A freshly spawned process.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// OS process ID, if the platform reported one.
    pub pid: Option<u32>,
    /// Resolves once when the process exits.
    pub exited: oneshot::Receiver<ExitReport>,
}

/// Spawns and terminates supervised processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn a process for `role`.
    ///
    /// Spawn-level OS errors surface as [`WardenError::LaunchFailed`].
    async fn launch(&self, role: Role, spec: &LaunchSpec) -> Result<LaunchedProcess>;

    /// Forcefully terminate a process by PID.
    ///
    /// Returns `true` if the process is gone afterwards.
    async fn terminate(&self, pid: u32) -> Result<bool>;
}

/// Launcher backed by `tokio::process`.
///
/// Child stdout lines are forwarded to the sink at info level and stderr
/// lines at warn level, each prefixed with the role.
#[derive(Clone)]
pub struct SystemLauncher {
    sink: SharedSink,
    kill_grace_ms: u64,
}

impl SystemLauncher {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            kill_grace_ms: PortConfig::KILL_GRACE_MS,
        }
    }

    fn forward_lines<R>(&self, role: Role, reader: R, is_stderr: bool)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message = format!("[{}] {}", role, line);
                if is_stderr {
                    sink.emit(LogEvent::warn(message));
                } else {
                    sink.emit(LogEvent::info(message));
                }
            }
        });
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn launch(&self, role: Role, spec: &LaunchSpec) -> Result<LaunchedProcess> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        info!("Launching {} process: {}", role, spec.command_line());

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {} process: {}", role, e);
            WardenError::LaunchFailed {
                role,
                message: format!("{}: {}", spec.command_line(), e),
            }
        })?;

        let pid = child.id();
        self.sink.emit(LogEvent::info(format!(
            "Started {} process (pid {}): {}",
            role,
            pid.map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            spec.command_line()
        )));

        if let Some(stdout) = child.stdout.take() {
            self.forward_lines(role, stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_lines(role, stderr, true);
        }

        let (tx, rx) = oneshot::channel();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let report = match child.wait().await {
                Ok(status) => exit_report(status),
                Err(e) => {
                    debug!("wait() on {} process failed: {}", role, e);
                    ExitReport::default()
                }
            };
            sink.emit(LogEvent::info(format!(
                "{} process exited with {}",
                role, report
            )));
            let _ = tx.send(report);
        });

        Ok(LaunchedProcess { pid, exited: rx })
    }

    async fn terminate(&self, pid: u32) -> Result<bool> {
        let grace = self.kill_grace_ms;
        tokio::task::spawn_blocking(move || platform::terminate_process_tree(pid, grace))
            .await
            .map_err(|e| WardenError::Other(format!("Task join error: {}", e)))?
    }
}

fn exit_report(status: std::process::ExitStatus) -> ExitReport {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitReport {
        code: status.code(),
        signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_primary_spec() {
        let settings = SupervisorSettings::new("/srv/bot");
        let spec = LaunchSpec::primary(&settings, Path::new("/srv/bot/models/m.tar.gz"));

        assert_eq!(spec.program, "python");
        assert_eq!(
            spec.command_line(),
            "python -m rasa run --model /srv/bot/models/m.tar.gz --enable-api --port 5005 --endpoints /srv/bot/endpoints.yml"
        );
        assert!(spec.cwd.is_none());
    }

    #[test]
    fn test_auxiliary_spec() {
        let settings = SupervisorSettings::new("/srv/bot").with_auxiliary_port(6055);
        let spec = LaunchSpec::auxiliary(&settings);

        assert_eq!(spec.command_line(), "python -m rasa run actions --port 6055");
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/bot")));
        assert_eq!(spec.env.get("PYTHONPATH"), Some(&"/srv/bot".to_string()));
    }

    #[test]
    fn test_exit_report_display() {
        let report = ExitReport {
            code: Some(1),
            signal: None,
        };
        assert_eq!(report.to_string(), "code 1, signal none");
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let sink = Arc::new(MemorySink::new(16));
        let launcher = SystemLauncher::new(sink);
        let spec = LaunchSpec::new("/definitely/not/a/real/binary");

        let result = launcher.launch(Role::Primary, &spec).await;
        assert!(matches!(
            result,
            Err(WardenError::LaunchFailed {
                role: Role::Primary,
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_captures_output_and_exit() {
        let sink = Arc::new(MemorySink::new(64));
        let launcher = SystemLauncher::new(sink.clone());
        let spec = LaunchSpec::new("sh").with_args(["-c", "echo hello; echo oops >&2; exit 3"]);

        let launched = launcher.launch(Role::Auxiliary, &spec).await.unwrap();
        assert!(launched.pid.is_some());

        let report = tokio::time::timeout(Duration::from_secs(10), launched.exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.code, Some(3));

        // Output readers run on their own tasks.
        for _ in 0..50 {
            if sink.contains("[auxiliary] hello") && sink.contains("[auxiliary] oops") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(sink.contains("Started auxiliary process"));
        assert!(sink.contains("[auxiliary] hello"));
        assert!(sink.contains("[auxiliary] oops"));
        assert!(sink.contains("auxiliary process exited with code 3"));
    }
}
