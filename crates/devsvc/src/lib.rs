//! devsvc: local development service orchestrator
//!
//! Provisions, configures, and supervises auxiliary service processes (a
//! database server, a dashboard server, or any other executable) for a
//! project under development.
//!
//! # Overview
//!
//! For a requested service devsvc:
//! - Resolves its configuration from profile defaults, the environment, and
//!   explicit overrides
//! - Creates its state layout under `<project_root>/.<service>`
//! - Runs an optional one-shot init step (e.g. `initdb`)
//! - Launches the binary and waits for a readiness probe to pass
//! - Supervises it: graceful stop, crash detection, bounded auto-restart
//!
//! # Example Profiles File
//!
//! ```yaml
//! version: "1.0"
//!
//! services:
//!   postgres:
//!     binary: postgres
//!     args: ["-D", "$(dir data)", "-p", "$(env PGPORT)"]
//!     required_dirs: [data, logs]
//!     env:
//!       PGPORT: 5432
//!     readiness:
//!       tcp:
//!         port: "$(env PGPORT)"
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod runtime;

pub use cli::CliArgs;
pub use config::{
    ConfigError, ConfigResolver, ProfileError, ProfilesFile, ResolvedConfig, ServiceProfile,
    SubstitutionContext, SubstitutionError,
};
pub use error::{OrchestratorError, Stage};
pub use layout::{FilesystemError, StateDirectoryManager};
pub use orchestrator::{Action, Orchestrator, OrchestratorConfig, Outcome};
pub use runtime::{
    ManagedProcess, ProcessConfig, ProcessError, ProcessEvent, ProcessSupervisor, ReadinessPolicy,
    ReadinessProbe, ServiceHandle, ServiceState, ServiceStatus, SupervisorError, SupervisorPolicy,
};
