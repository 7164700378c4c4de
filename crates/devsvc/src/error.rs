//! Pipeline errors and their process exit codes

use crate::config::{ConfigError, ProfileError};
use crate::layout::FilesystemError;
use crate::runtime::SupervisorError;
use std::fmt;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_FILESYSTEM: i32 = 3;
pub const EXIT_ALREADY_RUNNING: i32 = 4;
pub const EXIT_READINESS_TIMEOUT: i32 = 5;
pub const EXIT_CRASH_LOOP: i32 = 6;
pub const EXIT_UNKNOWN_SERVICE: i32 = 7;
pub const EXIT_TERMINATION: i32 = 8;
pub const EXIT_SPAWN: i32 = 9;
pub const EXIT_EXITED_DURING_STARTUP: i32 = 10;
pub const EXIT_CANCELLED: i32 = 11;

/// Pipeline stage an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lookup,
    Config,
    Filesystem,
    Supervisor,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Lookup => "lookup",
            Stage::Config => "config",
            Stage::Filesystem => "filesystem",
            Stage::Supervisor => "supervisor",
        })
    }
}

/// A failed orchestrator invocation, tagged with the service and stage
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("service '{service}' failed at lookup: unknown service (available: {available})")]
    UnknownService { service: String, available: String },

    #[error("service '{service}' failed at config: {source}")]
    Config {
        service: String,
        #[source]
        source: ConfigError,
    },

    #[error("service '{service}' failed at filesystem: {source}")]
    Filesystem {
        service: String,
        #[source]
        source: FilesystemError,
    },

    #[error("service '{service}' failed at supervisor: {source}")]
    Supervisor {
        service: String,
        #[source]
        source: SupervisorError,
    },
}

impl OrchestratorError {
    pub fn service(&self) -> &str {
        match self {
            OrchestratorError::UnknownService { service, .. }
            | OrchestratorError::Config { service, .. }
            | OrchestratorError::Filesystem { service, .. }
            | OrchestratorError::Supervisor { service, .. } => service,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            OrchestratorError::UnknownService { .. } => Stage::Lookup,
            OrchestratorError::Config { .. } => Stage::Config,
            OrchestratorError::Filesystem { .. } => Stage::Filesystem,
            OrchestratorError::Supervisor { .. } => Stage::Supervisor,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::UnknownService { .. } => EXIT_UNKNOWN_SERVICE,
            OrchestratorError::Config { .. } => EXIT_CONFIG,
            OrchestratorError::Filesystem { .. } => EXIT_FILESYSTEM,
            OrchestratorError::Supervisor { source, .. } => match source {
                SupervisorError::AlreadyRunning(_) => EXIT_ALREADY_RUNNING,
                SupervisorError::ReadinessTimeout { .. } => EXIT_READINESS_TIMEOUT,
                SupervisorError::CrashLoop { .. } => EXIT_CRASH_LOOP,
                SupervisorError::Termination { .. } => EXIT_TERMINATION,
                SupervisorError::Spawn { .. }
                | SupervisorError::InitFailed { .. }
                | SupervisorError::RestartFailed { .. } => EXIT_SPAWN,
                SupervisorError::ExitedDuringStartup { .. } => EXIT_EXITED_DURING_STARTUP,
                SupervisorError::Cancelled(_) => EXIT_CANCELLED,
            },
        }
    }
}

/// Exit code for a profiles file that could not be loaded
pub fn profile_exit_code(err: &ProfileError) -> i32 {
    match err {
        ProfileError::Io { .. } => EXIT_FAILURE,
        ProfileError::Parse(_) | ProfileError::Validation(_) => EXIT_CONFIG,
    }
}
