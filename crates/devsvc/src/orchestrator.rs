//! The `run(service, action)` pipeline: lookup, config, filesystem, supervisor

use crate::config::{ConfigResolver, ProfilesFile, ResolvedConfig, ServiceProfile};
use crate::error::OrchestratorError;
use crate::layout::StateDirectoryManager;
use crate::runtime::{
    pid_is_alive, request_terminate, run_once, terminate_pid, wait_for_exit, EventReceiver,
    EventSender, PidFile, ProcessConfig, ProcessEvent, ProcessSupervisor, ServiceHandle,
    ServiceState, ServiceStatus, SupervisorError, SupervisorPolicy,
};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Extra time allowed for another devsvc process to finish its own graceful stop
const REMOTE_STOP_MARGIN: Duration = Duration::from_secs(2);

/// How often `supervise` checks whether anything is still supervised
const SUPERVISION_CHECK: Duration = Duration::from_millis(250);

/// Lifecycle action requested for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Status,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "restart" => Ok(Action::Restart),
            "status" => Ok(Action::Status),
            other => Err(format!(
                "Unknown action '{}'. Expected one of: start, stop, restart, status",
                other
            )),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Status => "status",
        })
    }
}

/// Result of a successful action
#[derive(Debug)]
pub enum Outcome {
    /// Started (or restarted) and ready
    Started(ServiceHandle),
    Stopped { was_running: bool },
    Status(ServiceState),
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Project root; state roots live directly beneath it
    pub project_root: PathBuf,
    /// Explicit env overrides, highest precedence
    pub overrides: HashMap<String, String>,
    /// Grace period for stop and restart
    pub grace_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            overrides: HashMap::new(),
            grace_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs lifecycle actions for the services of one project
pub struct Orchestrator {
    config: OrchestratorConfig,
    profiles: ProfilesFile,
    resolver: ConfigResolver,
    supervisor: ProcessSupervisor,
    event_rx: EventReceiver,
    event_tx: EventSender,
}

impl Orchestrator {
    pub fn new(profiles: ProfilesFile, config: OrchestratorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let policy = SupervisorPolicy::from(&profiles.supervisor);
        let supervisor = ProcessSupervisor::new(policy).with_event_sender(event_tx.clone());
        Self {
            config,
            profiles,
            resolver: ConfigResolver::new(),
            supervisor,
            event_rx,
            event_tx,
        }
    }

    /// Resolve configuration against `resolver` instead of the process environment
    pub fn with_resolver(mut self, resolver: ConfigResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn profiles(&self) -> &ProfilesFile {
        &self.profiles
    }

    /// Run `action` for `service`
    pub async fn run(&self, service: &str, action: Action) -> Result<Outcome, OrchestratorError> {
        log::debug!("[{}] {}", service, action);
        match action {
            Action::Start => self.start(service).await.map(Outcome::Started),
            Action::Stop => self
                .stop(service)
                .await
                .map(|was_running| Outcome::Stopped { was_running }),
            Action::Restart => {
                self.stop(service).await?;
                self.start(service).await.map(Outcome::Started)
            }
            Action::Status => self.status(service).map(Outcome::Status),
        }
    }

    fn lookup(&self, service: &str) -> Result<&ServiceProfile, OrchestratorError> {
        self.profiles
            .get(service)
            .ok_or_else(|| OrchestratorError::UnknownService {
                service: service.to_string(),
                available: self.profiles.names().join(", "),
            })
    }

    /// Lookup and config stages only
    pub fn resolve(&self, service: &str) -> Result<ResolvedConfig, OrchestratorError> {
        let profile = self.lookup(service)?;
        self.resolver
            .resolve(profile, &self.config.overrides, &self.config.project_root)
            .map_err(|e| OrchestratorError::Config {
                service: service.to_string(),
                source: e,
            })
    }

    async fn start(&self, service: &str) -> Result<ServiceHandle, OrchestratorError> {
        let resolved = self.resolve(service)?;

        StateDirectoryManager::ensure_layout(&resolved.state_root, &resolved.required_dirs)
            .map_err(|e| OrchestratorError::Filesystem {
                service: service.to_string(),
                source: e,
            })?;

        let supervisor_err = |source| OrchestratorError::Supervisor {
            service: service.to_string(),
            source,
        };

        // Another invocation may have started the service since this one stopped it
        if !self.supervisor.is_supervised(service) {
            let pidfile = PidFile::for_service(&resolved.state_root, service);
            if let Some(record) = pidfile.read_live() {
                log::debug!(
                    "[{}] Owned by pid {} (supervisor {})",
                    service,
                    record.pid,
                    record.supervisor
                );
                return Err(supervisor_err(SupervisorError::AlreadyRunning(
                    service.to_string(),
                )));
            }
        }

        self.run_init(&resolved).await.map_err(supervisor_err)?;

        let handle = self.supervisor.start(&resolved).await.map_err(supervisor_err)?;
        log::info!(
            "[{}] Running with pid {}",
            service,
            handle.state().pid.unwrap_or(0)
        );
        Ok(handle)
    }

    /// Run the profile's init step unless its marker already exists
    async fn run_init(&self, resolved: &ResolvedConfig) -> Result<(), SupervisorError> {
        let Some(init) = &resolved.init else {
            return Ok(());
        };
        if init.creates.exists() {
            log::debug!(
                "[{}] Init skipped, '{}' exists",
                resolved.service_name,
                init.creates.display()
            );
            return Ok(());
        }

        log::info!("[{}] Running init step", resolved.service_name);
        let config = ProcessConfig {
            name: format!("{}-init", resolved.service_name),
            executable: init.binary.clone(),
            args: init.args.clone(),
            env: resolved.effective_env.clone(),
            working_dir: Some(resolved.working_dir.clone()),
        };
        run_once(&config, Some(&self.event_tx))
            .await
            .map_err(|e| SupervisorError::InitFailed {
                name: resolved.service_name.clone(),
                source: e,
            })
    }

    /// Stop through the in-process supervisor, falling back to the pidfile
    async fn stop(&self, service: &str) -> Result<bool, OrchestratorError> {
        let profile = self.lookup(service)?;
        let grace = self.config.grace_timeout;
        let supervisor_err = |source| OrchestratorError::Supervisor {
            service: service.to_string(),
            source,
        };

        let state_root = ConfigResolver::state_root(&self.config.project_root, &profile.name);
        let pidfile = PidFile::for_service(&state_root, service);
        let record = if self.supervisor.is_supervised(service) {
            None
        } else {
            pidfile.read_live()
        };
        let Some(record) = record else {
            let was_running = self
                .supervisor
                .stop(service, grace)
                .await
                .map_err(supervisor_err)?;
            if !was_running {
                log::info!("[{}] Not running", service);
            }
            return Ok(was_running);
        };

        let termination = |e| {
            supervisor_err(SupervisorError::Termination {
                name: service.to_string(),
                source: e,
            })
        };

        if record.supervisor_elsewhere() {
            // Let the owning devsvc stop its child gracefully
            log::info!(
                "[{}] Asking supervisor {} to stop pid {}",
                service,
                record.supervisor,
                record.pid
            );
            request_terminate(record.supervisor).map_err(termination)?;
            if !wait_for_exit(record.pid, grace + REMOTE_STOP_MARGIN).await {
                terminate_pid(record.pid, grace).await.map_err(termination)?;
            }
        } else if record.service_alive() {
            log::info!("[{}] Stopping pid {}", service, record.pid);
            terminate_pid(record.pid, grace).await.map_err(termination)?;
        }

        if let Err(e) = pidfile.remove() {
            log::warn!("[{}] Failed to remove pidfile: {}", service, e);
        }
        Ok(true)
    }

    /// Status from the in-process supervisor, or from the pidfile
    fn status(&self, service: &str) -> Result<ServiceState, OrchestratorError> {
        let profile = self.lookup(service)?;

        if self.supervisor.is_supervised(service) {
            return Ok(self.supervisor.status(service));
        }

        let state_root = ConfigResolver::state_root(&self.config.project_root, &profile.name);
        let pidfile = PidFile::for_service(&state_root, service);
        let state = match pidfile.read_live() {
            Some(record) if pid_is_alive(record.pid) => ServiceState {
                pid: Some(record.pid),
                status: ServiceStatus::Running,
                started_at: Some(record.started_at()),
                restart_count: 0,
            },
            // The supervisor is alive but its child is not: between restarts, or given up
            Some(_) => ServiceState {
                status: ServiceStatus::Crashed,
                ..ServiceState::default()
            },
            // Last known in-process state, e.g. after a crash loop
            None => self.supervisor.status(service),
        };
        Ok(state)
    }

    /// Forward events until shutdown is requested or supervision ends
    ///
    /// Returns an error when a supervised service enters a crash loop or
    /// cannot be restarted.
    pub async fn supervise(
        &mut self,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        let mut check = tokio::time::interval(SUPERVISION_CHECK);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    log::info!("Shutdown requested, stopping supervised services");
                    return Ok(());
                }

                event = self.event_rx.recv() => {
                    let Some((name, event)) = event else {
                        return Ok(());
                    };
                    let failure = match &event {
                        ProcessEvent::CrashLoop { restarts } => Some(SupervisorError::CrashLoop {
                            name: name.clone(),
                            restarts: *restarts,
                        }),
                        ProcessEvent::Failed { error } => Some(SupervisorError::RestartFailed {
                            name: name.clone(),
                            error: error.clone(),
                        }),
                        _ => None,
                    };
                    log_event(&name, event);
                    if let Some(source) = failure {
                        return Err(OrchestratorError::Supervisor {
                            service: name,
                            source,
                        });
                    }
                }

                // Queued events are handled first, so a crash loop is never missed here
                _ = check.tick() => {
                    if !self.any_supervised() {
                        log::info!("No supervised service left running");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// A crashed service waiting for its restart still counts
    fn any_supervised(&self) -> bool {
        self.profiles
            .services
            .keys()
            .any(|name| self.supervisor.is_supervised(name))
    }

    /// Log any events queued so far without waiting for more
    pub fn drain_events(&mut self) {
        while let Ok((name, event)) = self.event_rx.try_recv() {
            log_event(&name, event);
        }
    }

    /// Stop everything this orchestrator started
    pub async fn shutdown(&mut self) {
        log::info!("Shutting down services...");
        let grace = self.config.grace_timeout;
        for name in self.profiles.names() {
            if self.supervisor.handle(&name).is_none() {
                continue;
            }
            if let Err(e) = self.supervisor.stop(&name, grace).await {
                log::error!("[{}] Failed to stop: {}", name, e);
            }
        }
        self.drain_events();
        log::info!("All services stopped");
    }

    /// Clean up after a failed action before the process exits
    ///
    /// A child that never became ready is still owned by the supervisor and
    /// gets stopped here.
    pub async fn abandon(&mut self, err: &OrchestratorError) {
        self.drain_events();
        if let OrchestratorError::Supervisor {
            source: SupervisorError::ReadinessTimeout { .. },
            ..
        } = err
        {
            self.shutdown().await;
        }
    }
}

fn log_event(name: &str, event: ProcessEvent) {
    match event {
        ProcessEvent::Started { pid } => log::debug!("[{}] Started with pid {}", name, pid),
        ProcessEvent::Output { line, is_stderr } => {
            if is_stderr {
                log::warn!("[{}] {}", name, line);
            } else {
                log::info!("[{}] {}", name, line);
            }
        }
        ProcessEvent::Ready => log::debug!("[{}] Ready", name),
        ProcessEvent::ReadinessTimeout => log::warn!("[{}] Readiness timed out", name),
        ProcessEvent::Crashed {
            code,
            restart_count,
        } => log::warn!(
            "[{}] Crashed with code {:?} after {} restarts",
            name,
            code,
            restart_count
        ),
        ProcessEvent::Restarting { attempt } => {
            log::info!("[{}] Restart attempt {}", name, attempt)
        }
        ProcessEvent::CrashLoop { restarts } => {
            log::error!("[{}] Crash loop after {} restarts", name, restarts)
        }
        ProcessEvent::Stopped { code } => {
            log::info!("[{}] Process exited with code: {:?}", name, code)
        }
        ProcessEvent::Failed { error } => log::error!("[{}] Process failed: {}", name, error),
    }
}
