//! Managed child processes: spawning, output forwarding, and termination

use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Channel carrying `(service name, event)` pairs
pub type EventSender = mpsc::UnboundedSender<(String, ProcessEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(String, ProcessEvent)>;

/// How long to wait for a SIGKILLed child to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness polling interval for processes we do not own
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to launch one child process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Name used as the log prefix
    pub name: String,
    /// Executable path
    pub executable: PathBuf,
    /// Arguments, already expanded
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

/// Event emitted while supervising a service
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Process spawned
    Started { pid: u32 },
    /// Process output line (stdout or stderr)
    Output { line: String, is_stderr: bool },
    /// Readiness probe passed
    Ready,
    /// Readiness probe did not pass before the deadline
    ReadinessTimeout,
    /// Process exited without being asked to
    Crashed { code: Option<i32>, restart_count: u32 },
    /// Automatic restart about to spawn
    Restarting { attempt: u32 },
    /// Too many crashes inside the restart window; no further restarts
    CrashLoop { restarts: u32 },
    /// Process stopped on request, or exited after supervision gave up on it
    Stopped { code: Option<i32> },
    /// Process could not be spawned
    Failed { error: String },
}

/// A spawned child process
pub struct ManagedProcess {
    name: String,
    pid: u32,
    started_at: Instant,
    child: Child,
}

impl ManagedProcess {
    /// Spawn the process, forwarding its output lines to `events`
    pub fn spawn(config: &ProcessConfig, events: Option<&EventSender>) -> Result<Self, ProcessError> {
        log::info!(
            "[{}] Starting: {} {}",
            config.name,
            config.executable.display(),
            config.args.join(" ")
        );

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a forced kill also reaches grandchildren
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = format!("Failed to spawn process: {}", e);
                log::error!("[{}] {}", config.name, error);
                if let Some(tx) = events {
                    let _ = tx.send((config.name.clone(), ProcessEvent::Failed { error }));
                }
                return Err(ProcessError::SpawnFailed {
                    name: config.name.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        log::debug!("[{}] Spawned with pid {}", config.name, pid);

        if let Some(tx) = events {
            let _ = tx.send((config.name.clone(), ProcessEvent::Started { pid }));
            if let Some(stdout) = child.stdout.take() {
                forward_lines(config.name.clone(), stdout, false, tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(config.name.clone(), stderr, true, tx.clone());
            }
        }

        Ok(Self {
            name: config.name.clone(),
            pid,
            started_at: Instant::now(),
            child,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait for the process to exit; cancel safe
    pub async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        self.child
            .wait()
            .await
            .map(|status| status.code())
            .map_err(|e| ProcessError::Wait {
                name: self.name.clone(),
                source: e,
            })
    }

    /// Stop the process gracefully (SIGTERM, then SIGKILL after `grace`)
    ///
    /// Returns the exit code, `None` when the process was killed by a signal.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, ProcessError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(status.code());
        }

        log::info!("[{}] Stopping process...", self.name);

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(ProcessError::Signal {
                        pid: self.pid,
                        message: e.to_string(),
                    })
                }
            }
        }

        #[cfg(not(unix))]
        {
            // No graceful signal on non-unix: the grace period is skipped
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("[{}] Process exited with code: {:?}", self.name, status.code());
                return Ok(status.code());
            }
            Ok(Err(e)) => {
                return Err(ProcessError::Wait {
                    name: self.name.clone(),
                    source: e,
                })
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {:?}, forcing kill",
                    self.name,
                    grace
                );
            }
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }

        self.child
            .start_kill()
            .or_else(|e| match e.kind() {
                // Already exited between the timeout and the kill
                std::io::ErrorKind::InvalidInput => Ok(()),
                _ => Err(e),
            })
            .map_err(|e| ProcessError::KillFailed {
                name: self.name.clone(),
                source: e,
            })?;

        match tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Ok(status.code()),
            Ok(Err(e)) => Err(ProcessError::Wait {
                name: self.name.clone(),
                source: e,
            }),
            Err(_) => Err(ProcessError::StillAlive { pid: self.pid }),
        }
    }
}

fn forward_lines<R>(name: String, stream: R, is_stderr: bool, tx: EventSender)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx
                .send((name.clone(), ProcessEvent::Output { line, is_stderr }))
                .is_err()
            {
                break;
            }
        }
    });
}

/// Run a process to completion, failing on a non-zero exit
pub async fn run_once(config: &ProcessConfig, events: Option<&EventSender>) -> Result<(), ProcessError> {
    let mut process = ManagedProcess::spawn(config, events)?;
    match process.wait().await? {
        Some(0) => {
            log::info!(
                "[{}] Finished in {:.1}s",
                config.name,
                process.uptime().as_secs_f64()
            );
            Ok(())
        }
        code => Err(ProcessError::NonZeroExit {
            name: config.name.clone(),
            code,
        }),
    }
}

/// Whether a process with this pid exists
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// Poll until `pid` is gone; returns false if it is still alive after `timeout`
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Send SIGTERM to `pid`; returns false if there is no such process
#[cfg(unix)]
pub fn request_terminate(pid: u32) -> Result<bool, ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(ProcessError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn request_terminate(pid: u32) -> Result<bool, ProcessError> {
    Err(ProcessError::Signal {
        pid,
        message: "signals are not supported on this platform".to_string(),
    })
}

/// Terminate a process this invocation did not spawn
///
/// SIGTERM, poll for up to `grace`, then SIGKILL. Returns whether the
/// process was alive to begin with.
#[cfg(unix)]
pub async fn terminate_pid(pid: u32, grace: Duration) -> Result<bool, ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if !pid_is_alive(pid) {
        return Ok(false);
    }
    if !request_terminate(pid)? {
        return Ok(true);
    }

    let target = Pid::from_raw(pid as i32);
    if wait_for_exit(pid, grace).await {
        return Ok(true);
    }

    log::warn!("Process {} did not exit within {:?}, forcing kill", pid, grace);
    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(ProcessError::Signal {
                pid,
                message: e.to_string(),
            })
        }
    }

    if wait_for_exit(pid, KILL_REAP_TIMEOUT).await {
        Ok(true)
    } else {
        Err(ProcessError::StillAlive { pid })
    }
}

#[cfg(not(unix))]
pub async fn terminate_pid(pid: u32, _grace: Duration) -> Result<bool, ProcessError> {
    Err(ProcessError::Signal {
        pid,
        message: "signals are not supported on this platform".to_string(),
    })
}

/// Failures while managing a child process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Failed to kill process '{name}': {source}")]
    KillFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{name}' exited with code {code:?}")]
    NonZeroExit { name: String, code: Option<i32> },

    #[error("Process {pid} is still alive after SIGKILL")]
    StillAlive { pid: u32 },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: IndexMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_output_is_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = sh("echo", "echo \"hello $GREETING\"; echo oops >&2");
        config
            .env
            .insert("GREETING".to_string(), "world".to_string());

        let mut process = ManagedProcess::spawn(&config, Some(&tx)).unwrap();
        assert_eq!(process.wait().await.unwrap(), Some(0));
        drop(tx);

        let mut events = Vec::new();
        while let Some((name, event)) = rx.recv().await {
            assert_eq!(name, "echo");
            events.push(event);
        }
        assert!(matches!(events[0], ProcessEvent::Started { .. }));
        assert!(events.contains(&ProcessEvent::Output {
            line: "hello world".to_string(),
            is_stderr: false
        }));
        assert!(events.contains(&ProcessEvent::Output {
            line: "oops".to_string(),
            is_stderr: true
        }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = ProcessConfig {
            executable: PathBuf::from("/nonexistent/binary"),
            ..sh("missing", "")
        };
        let result = ManagedProcess::spawn(&config, None);
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut process = ManagedProcess::spawn(&sh("sleeper", "exec sleep 30"), None).unwrap();
        let pid = process.pid();
        assert!(pid_is_alive(pid));

        let started = Instant::now();
        let code = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let script = "trap '' TERM; while :; do sleep 0.1; done";
        let mut process = ManagedProcess::spawn(&sh("stubborn", script), None).unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        process.terminate(Duration::from_millis(300)).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_run_once_reports_exit_code() {
        run_once(&sh("ok", "exit 0"), None).await.unwrap();

        let result = run_once(&sh("bad", "exit 4"), None).await;
        assert!(matches!(
            result,
            Err(ProcessError::NonZeroExit { code: Some(4), .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_pid() {
        let child = std::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();

        // Reap in the background so the pid disappears once killed
        let reaper = std::thread::spawn(move || {
            let mut child = child;
            child.wait()
        });

        assert!(terminate_pid(pid, Duration::from_secs(2)).await.unwrap());
        reaper.join().unwrap().unwrap();
        assert!(!pid_is_alive(pid));
        assert!(!terminate_pid(pid, Duration::from_millis(10)).await.unwrap());
    }
}
