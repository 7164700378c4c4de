//! Service lifecycle: start, readiness, stop, crash watching, and bounded restarts
//!
//! Every live service is owned by one background task. The task holds the
//! child process, polls readiness, and watches for unexpected exits. Commands
//! reach it through a small mailbox and its state is published on a watch
//! channel, so [`ProcessSupervisor::status`] never waits on the task.

use crate::config::{ResolvedConfig, SupervisorSettings};
use crate::runtime::pidfile::{PidFile, PidRecord};
use crate::runtime::process::{EventSender, ManagedProcess, ProcessConfig, ProcessError, ProcessEvent};
use crate::runtime::readiness::{wait_until_ready, ReadinessError, ReadinessPolicy, ReadinessProbe};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Crashed,
    Stopping,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Crashed => "crashed",
            ServiceStatus::Stopping => "stopping",
        }
    }

    /// Running or on its way there
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Starting)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub pid: Option<u32>,
    pub status: ServiceStatus,
    pub started_at: Option<SystemTime>,
    /// Automatic restarts since the last explicit start
    pub restart_count: u32,
}

/// Restart and readiness tuning for the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_delay: Duration,
    /// Grace period when the supervisor stops a child on its own
    pub stop_grace: Duration,
    pub readiness: ReadinessPolicy,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

impl From<&SupervisorSettings> for SupervisorPolicy {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            restart_window: settings.restart_window(),
            restart_delay: settings.restart_delay(),
            stop_grace: settings.stop_grace(),
            readiness: ReadinessPolicy::from(&settings.readiness),
        }
    }
}

/// Read-only view of a supervised service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    name: String,
    state: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, without waiting
    pub fn state(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    /// Wait until the service reaches `status`
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_status(&self, status: ServiceStatus, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.status == status)).await,
            Ok(Ok(_))
        );
        reached
    }
}

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

enum Control {
    Stop { grace: Duration, reply: Reply },
}

struct ServiceSlot {
    state: Arc<watch::Sender<ServiceState>>,
    /// Mailbox of the live task; the mutex serializes start and stop
    control: Mutex<Option<mpsc::Sender<Control>>>,
}

impl ServiceSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(ServiceState::default());
        Self {
            state: Arc::new(state),
            control: Mutex::new(None),
        }
    }

    fn handle(&self, name: &str) -> ServiceHandle {
        ServiceHandle {
            name: name.to_string(),
            state: self.state.subscribe(),
        }
    }
}

/// Supervises service processes, at most one live process per service name
pub struct ProcessSupervisor {
    policy: SupervisorPolicy,
    services: RwLock<HashMap<String, Arc<ServiceSlot>>>,
    events: Option<EventSender>,
}

impl ProcessSupervisor {
    pub fn new(policy: SupervisorPolicy) -> Self {
        Self {
            policy,
            services: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Forward lifecycle and output events to `tx`
    pub fn with_event_sender(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    fn existing(&self, name: &str) -> Option<Arc<ServiceSlot>> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services.get(name).cloned()
    }

    fn slot(&self, name: &str) -> Arc<ServiceSlot> {
        if let Some(slot) = self.existing(name) {
            return slot;
        }
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServiceSlot::new()))
            .clone()
    }

    /// Start a service and wait until it is ready
    ///
    /// The command lock is released before readiness is awaited, so a
    /// concurrent [`stop`](Self::stop) cancels the start.
    pub async fn start(&self, config: &ResolvedConfig) -> Result<ServiceHandle, SupervisorError> {
        let name = config.service_name.clone();
        let slot = self.slot(&name);

        let ready = {
            let mut control = slot.control.lock().await;
            if control.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return Err(SupervisorError::AlreadyRunning(name));
            }

            let process_config = ProcessConfig {
                name: name.clone(),
                executable: config.binary.clone(),
                args: config.effective_args.clone(),
                env: config.effective_env.clone(),
                working_dir: Some(config.working_dir.clone()),
            };
            let process = ManagedProcess::spawn(&process_config, self.events.as_ref()).map_err(
                |e| SupervisorError::Spawn {
                    name: name.clone(),
                    source: e,
                },
            )?;

            let pid = process.pid();
            slot.state.send_modify(|s| {
                *s = ServiceState {
                    pid: Some(pid),
                    status: ServiceStatus::Starting,
                    started_at: Some(SystemTime::now()),
                    restart_count: 0,
                }
            });

            let readiness = match config.readiness_timeout {
                Some(timeout) => self.policy.readiness.clone().with_timeout(timeout),
                None => self.policy.readiness.clone(),
            };

            let (tx, rx) = mpsc::channel(4);
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = ServiceTask {
                name: name.clone(),
                process_config,
                probe: config.readiness.clone(),
                readiness,
                policy: self.policy.clone(),
                state: slot.state.clone(),
                control: rx,
                events: self.events.clone(),
                pidfile: PidFile::for_service(&config.state_root, &name),
                crashes: VecDeque::new(),
            };
            task.record_pid(pid);
            tokio::spawn(task.run(process, ready_tx));

            *control = Some(tx);
            ready_rx
        };

        match ready.await {
            Ok(Ok(())) => Ok(slot.handle(&name)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SupervisorError::Cancelled(name)),
        }
    }

    /// Stop a service: SIGTERM, up to `grace` to exit, then SIGKILL
    ///
    /// Returns whether a process was stopped. Stopping a stopped service is a no-op.
    pub async fn stop(&self, name: &str, grace: Duration) -> Result<bool, SupervisorError> {
        let Some(slot) = self.existing(name) else {
            return Ok(false);
        };

        let mut control = slot.control.lock().await;
        let Some(tx) = control.take() else {
            Self::settle(&slot);
            return Ok(false);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Control::Stop { grace, reply: reply_tx }).await.is_err() {
            // Task already gave up on the service
            Self::settle(&slot);
            return Ok(false);
        }

        match reply_rx.await {
            Ok(result) => result.map(|()| true),
            Err(_) if slot.state.borrow().pid.is_none() => {
                Self::settle(&slot);
                Ok(false)
            }
            Err(_) => Err(SupervisorError::Termination {
                name: name.to_string(),
                source: ProcessError::StillAlive {
                    pid: slot.state.borrow().pid.unwrap_or(0),
                },
            }),
        }
    }

    /// A crashed service with no process left reads as stopped after a stop
    fn settle(slot: &ServiceSlot) {
        slot.state.send_if_modified(|s| {
            if s.pid.is_none() && s.status != ServiceStatus::Stopped {
                s.status = ServiceStatus::Stopped;
                true
            } else {
                false
            }
        });
    }

    /// Snapshot of a service; unknown services read as stopped
    pub fn status(&self, name: &str) -> ServiceState {
        self.existing(name)
            .map(|slot| slot.state.borrow().clone())
            .unwrap_or_default()
    }

    /// Whether a background task still owns the service, including between restarts
    pub fn is_supervised(&self, name: &str) -> bool {
        let Some(slot) = self.existing(name) else {
            return false;
        };
        let supervised = match slot.control.try_lock() {
            Ok(control) => control.as_ref().is_some_and(|tx| !tx.is_closed()),
            // A start or stop is in flight
            Err(_) => true,
        };
        supervised
    }

    pub fn handle(&self, name: &str) -> Option<ServiceHandle> {
        self.existing(name).map(|slot| slot.handle(name))
    }

    /// Stop every supervised service
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let services = self.services.read().unwrap_or_else(|e| e.into_inner());
            services.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.stop(&name, self.policy.stop_grace).await {
                log::error!("[{}] Failed to stop during shutdown: {}", name, e);
            }
        }
    }
}

/// How the readiness phase ended
enum Startup {
    Ready,
    TimedOut(ReadinessError),
    Exited(Option<i32>),
    Stop { grace: Duration, reply: Reply },
    Detached,
}

/// How the running phase ended
enum Running {
    Exited(Option<i32>),
    Stop { grace: Duration, reply: Reply },
    Detached,
}

struct ServiceTask {
    name: String,
    process_config: ProcessConfig,
    probe: ReadinessProbe,
    readiness: ReadinessPolicy,
    policy: SupervisorPolicy,
    state: Arc<watch::Sender<ServiceState>>,
    control: mpsc::Receiver<Control>,
    events: Option<EventSender>,
    pidfile: PidFile,
    /// Crash times inside the restart window
    crashes: VecDeque<Instant>,
}

impl ServiceTask {
    async fn run(mut self, mut process: ManagedProcess, ready_tx: oneshot::Sender<Result<(), SupervisorError>>) {
        let mut ready_tx = Some(ready_tx);

        loop {
            match self.await_ready(&mut process).await {
                Startup::Ready => {
                    self.state.send_modify(|s| s.status = ServiceStatus::Running);
                    log::info!("[{}] Ready (pid {})", self.name, process.pid());
                    self.emit(ProcessEvent::Ready);
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Startup::TimedOut(err) => {
                    log::warn!("[{}] {}", self.name, err);
                    self.state.send_modify(|s| s.status = ServiceStatus::Crashed);
                    self.emit(ProcessEvent::ReadinessTimeout);

                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(SupervisorError::ReadinessTimeout {
                            name: self.name.clone(),
                            source: err,
                        }));
                        // The child is left to the caller; keep owning it until told to stop
                        self.linger(process).await;
                        return;
                    }

                    // A restarted child that never becomes ready counts as a crash
                    let code = match process.terminate(self.policy.stop_grace).await {
                        Ok(code) => code,
                        Err(e) => {
                            log::error!("[{}] {}", self.name, e);
                            None
                        }
                    };
                    match self.restart_after_crash(code).await {
                        Some(next) => {
                            process = next;
                            continue;
                        }
                        None => return,
                    }
                }
                Startup::Exited(code) => {
                    if let Some(tx) = ready_tx.take() {
                        log::error!("[{}] Exited during startup with code {:?}", self.name, code);
                        self.finish(ServiceStatus::Crashed);
                        self.emit(ProcessEvent::Stopped { code });
                        let _ = tx.send(Err(SupervisorError::ExitedDuringStartup {
                            name: self.name.clone(),
                            code,
                        }));
                        return;
                    }
                    match self.restart_after_crash(code).await {
                        Some(next) => {
                            process = next;
                            continue;
                        }
                        None => return,
                    }
                }
                Startup::Stop { grace, reply } => {
                    log::info!("[{}] Start cancelled by stop", self.name);
                    let result = self.stop_child(process, grace).await;
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(SupervisorError::Cancelled(self.name.clone())));
                    }
                    let _ = reply.send(result);
                    return;
                }
                Startup::Detached => {
                    let grace = self.policy.stop_grace;
                    let _ = self.stop_child(process, grace).await;
                    return;
                }
            }

            match self.watch_running(&mut process).await {
                Running::Exited(code) => match self.restart_after_crash(code).await {
                    Some(next) => process = next,
                    None => return,
                },
                Running::Stop { grace, reply } => {
                    let result = self.stop_child(process, grace).await;
                    let _ = reply.send(result);
                    return;
                }
                Running::Detached => {
                    let grace = self.policy.stop_grace;
                    let _ = self.stop_child(process, grace).await;
                    return;
                }
            }
        }
    }

    async fn await_ready(&mut self, process: &mut ManagedProcess) -> Startup {
        let ready = wait_until_ready(&self.probe, &self.readiness);
        tokio::pin!(ready);

        tokio::select! {
            biased;
            cmd = self.control.recv() => match cmd {
                Some(Control::Stop { grace, reply }) => Startup::Stop { grace, reply },
                None => Startup::Detached,
            },
            exit = process.wait() => Startup::Exited(exit.unwrap_or(None)),
            result = &mut ready => match result {
                Ok(attempts) => {
                    log::debug!("[{}] Readiness passed after {} attempts", self.name, attempts);
                    Startup::Ready
                }
                Err(e) => Startup::TimedOut(e),
            },
        }
    }

    async fn watch_running(&mut self, process: &mut ManagedProcess) -> Running {
        tokio::select! {
            biased;
            cmd = self.control.recv() => match cmd {
                Some(Control::Stop { grace, reply }) => Running::Stop { grace, reply },
                None => Running::Detached,
            },
            exit = process.wait() => Running::Exited(exit.unwrap_or(None)),
        }
    }

    /// Keep a never-ready child until it exits or a stop arrives
    async fn linger(&mut self, mut process: ManagedProcess) {
        let outcome = self.watch_running(&mut process).await;
        match outcome {
            Running::Exited(code) => {
                log::info!("[{}] Process exited with code: {:?}", self.name, code);
                self.finish(ServiceStatus::Crashed);
                self.emit(ProcessEvent::Stopped { code });
            }
            Running::Stop { grace, reply } => {
                let result = self.stop_child(process, grace).await;
                let _ = reply.send(result);
            }
            Running::Detached => {
                let grace = self.policy.stop_grace;
                let _ = self.stop_child(process, grace).await;
            }
        }
    }

    async fn stop_child(&mut self, mut process: ManagedProcess, grace: Duration) -> Result<(), SupervisorError> {
        self.state.send_modify(|s| s.status = ServiceStatus::Stopping);
        match process.terminate(grace).await {
            Ok(code) => {
                log::info!("[{}] Stopped", self.name);
                self.finish(ServiceStatus::Stopped);
                self.emit(ProcessEvent::Stopped { code });
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] Failed to stop: {}", self.name, e);
                self.state.send_modify(|s| s.status = ServiceStatus::Crashed);
                Err(SupervisorError::Termination {
                    name: self.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Handle an unexpected exit; returns the replacement process if one was spawned
    async fn restart_after_crash(&mut self, code: Option<i32>) -> Option<ManagedProcess> {
        let restart_count = self.state.borrow().restart_count;
        self.state.send_modify(|s| {
            s.status = ServiceStatus::Crashed;
            s.pid = None;
        });
        log::warn!("[{}] Exited unexpectedly with code {:?}", self.name, code);
        self.emit(ProcessEvent::Crashed {
            code,
            restart_count,
        });

        if !self.record_crash(Instant::now()) {
            log::error!(
                "[{}] Crashed {} times within {:?}, giving up",
                self.name,
                self.crashes.len(),
                self.policy.restart_window
            );
            self.finish(ServiceStatus::Crashed);
            self.emit(ProcessEvent::CrashLoop {
                restarts: restart_count,
            });
            return None;
        }

        tokio::select! {
            biased;
            cmd = self.control.recv() => {
                self.finish(ServiceStatus::Stopped);
                if let Some(Control::Stop { reply, .. }) = cmd {
                    let _ = reply.send(Ok(()));
                }
                return None;
            }
            _ = tokio::time::sleep(self.policy.restart_delay) => {}
        }

        let attempt = restart_count + 1;
        log::info!("[{}] Restarting (attempt {})", self.name, attempt);
        self.emit(ProcessEvent::Restarting { attempt });

        match ManagedProcess::spawn(&self.process_config, self.events.as_ref()) {
            Ok(process) => {
                let pid = process.pid();
                self.state.send_modify(|s| {
                    s.status = ServiceStatus::Starting;
                    s.pid = Some(pid);
                    s.started_at = Some(SystemTime::now());
                    s.restart_count = attempt;
                });
                self.record_pid(pid);
                Some(process)
            }
            Err(e) => {
                // `spawn` already reported `ProcessEvent::Failed`
                log::error!("[{}] Restart failed: {}", self.name, e);
                self.finish(ServiceStatus::Crashed);
                None
            }
        }
    }

    /// Record a crash; returns false once the crashes inside the window exceed the budget
    fn record_crash(&mut self, now: Instant) -> bool {
        self.crashes.push_back(now);
        while let Some(first) = self.crashes.front() {
            if now.duration_since(*first) > self.policy.restart_window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.len() as u32 <= self.policy.max_restarts
    }

    fn record_pid(&self, pid: u32) {
        if let Err(e) = self.pidfile.write(&PidRecord::new(pid)) {
            log::warn!(
                "[{}] Failed to write pidfile '{}': {}",
                self.name,
                self.pidfile.path().display(),
                e
            );
        }
    }

    /// No process left: publish the final status and drop the pidfile
    fn finish(&self, status: ServiceStatus) {
        self.state.send_modify(|s| {
            s.status = status;
            s.pid = None;
        });
        if let Err(e) = self.pidfile.remove() {
            log::warn!("[{}] Failed to remove pidfile: {}", self.name, e);
        }
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send((self.name.clone(), event));
        }
    }
}

/// Errors reported by the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn service '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("Init step for service '{name}' failed: {source}")]
    InitFailed {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("Service '{name}' could not be restarted: {error}")]
    RestartFailed { name: String, error: String },

    #[error("Service '{name}' did not become ready: {source}")]
    ReadinessTimeout {
        name: String,
        #[source]
        source: ReadinessError,
    },

    #[error("Service '{name}' exited during startup with code {code:?}")]
    ExitedDuringStartup { name: String, code: Option<i32> },

    #[error("Service '{name}' is crash looping ({restarts} restarts)")]
    CrashLoop { name: String, restarts: u32 },

    #[error("Failed to stop service '{name}': {source}")]
    Termination {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("Start of service '{0}' was cancelled")]
    Cancelled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_policy(max_restarts: u32, window_ms: u64) -> SupervisorPolicy {
        SupervisorPolicy {
            max_restarts,
            restart_window: Duration::from_millis(window_ms),
            ..SupervisorPolicy::default()
        }
    }

    fn task(policy: SupervisorPolicy) -> ServiceTask {
        let (state, _) = watch::channel(ServiceState::default());
        let (_tx, control) = mpsc::channel(1);
        ServiceTask {
            name: "svc".to_string(),
            process_config: ProcessConfig {
                name: "svc".to_string(),
                executable: "/bin/true".into(),
                args: Vec::new(),
                env: Default::default(),
                working_dir: None,
            },
            probe: ReadinessProbe::None,
            readiness: policy.readiness.clone(),
            policy,
            state: Arc::new(state),
            control,
            events: None,
            pidfile: PidFile::for_service(std::path::Path::new("/nonexistent"), "svc"),
            crashes: VecDeque::new(),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = SupervisorPolicy::default();
        assert_eq!(policy.max_restarts, 3);
        assert_eq!(policy.restart_window, Duration::from_secs(60));
        assert_eq!(policy.readiness.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_crash_budget_inside_window() {
        let mut task = task(window_policy(3, 60_000));
        let now = Instant::now();
        assert!(task.record_crash(now));
        assert!(task.record_crash(now));
        assert!(task.record_crash(now));
        assert!(!task.record_crash(now));
    }

    #[test]
    fn test_old_crashes_leave_the_window() {
        let mut task = task(window_policy(1, 100));
        let start = Instant::now();
        assert!(task.record_crash(start));
        assert!(!task.record_crash(start + Duration::from_millis(50)));

        // Both earlier crashes fall out of the window
        assert!(task.record_crash(start + Duration::from_millis(500)));
        assert_eq!(task.crashes.len(), 1);
    }

    #[test]
    fn test_status_of_unknown_service() {
        let supervisor = ProcessSupervisor::new(SupervisorPolicy::default());
        assert_eq!(supervisor.status("nope"), ServiceState::default());
        assert_eq!(supervisor.status("nope").status, ServiceStatus::Stopped);
        assert!(supervisor.handle("nope").is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_service_is_noop() {
        let supervisor = ProcessSupervisor::new(SupervisorPolicy::default());
        assert!(!supervisor.stop("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ServiceStatus::Running.to_string(), "running");
        assert!(ServiceStatus::Starting.is_active());
        assert!(!ServiceStatus::Crashed.is_active());
    }
}
