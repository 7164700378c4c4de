//! Service profile YAML schema

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::time::Duration;

/// Profiles shipped with the binary, used when the project has no profiles file
const BUILTIN_PROFILES: &str = include_str!("../../profiles/default.yaml");

/// Root profiles file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesFile {
    /// Profiles file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Supervision tuning shared by all services
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Service definitions (ordered map for deterministic listing)
    pub services: IndexMap<String, ServiceProfile>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Restart and readiness tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Crashes tolerated inside the restart window before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding window for crash counting, in seconds
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Pause before an automatic restart, in milliseconds
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Grace period used when the supervisor itself has to stop a child
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default)]
    pub readiness: ReadinessSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            restart_delay_ms: default_restart_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            readiness: ReadinessSettings::default(),
        }
    }
}

/// Readiness polling tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessSettings {
    /// First delay between probe attempts (in milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the doubling delay (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout of a single probe attempt (in milliseconds)
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Deadline for the whole readiness phase (in milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_max_restarts() -> u32 {
    3
}
fn default_restart_window_secs() -> u64 {
    60
}
fn default_restart_delay_ms() -> u64 {
    500
}
fn default_stop_grace_ms() -> u64 {
    10_000
}
fn default_initial_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_attempt_timeout_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl SupervisorSettings {
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Validate the settings and return errors if invalid
    pub fn validate(&self) -> Result<(), ProfileError> {
        let r = &self.readiness;
        if r.initial_delay_ms > r.max_delay_ms {
            return Err(ProfileError::Validation(
                "readiness.initial_delay_ms cannot be greater than readiness.max_delay_ms"
                    .to_string(),
            ));
        }
        if r.timeout_ms == 0 {
            return Err(ProfileError::Validation(
                "readiness.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.restart_window_secs == 0 {
            return Err(ProfileError::Validation(
                "restart_window_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scalar values accepted where a string is expected
///
/// Lets `PGPORT: 5432` be written without quotes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    /// Render as a single command-line argument
    pub fn as_str(&self) -> String {
        match self {
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::String(s) => s.clone(),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::String(value.to_string())
    }
}

/// Declarative description of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProfile {
    /// Service name, taken from the key in `services`
    #[serde(skip)]
    pub name: String,

    /// Executable path (relative to the project root) or a bare name looked up on PATH
    pub binary: String,

    /// Argument template; tokens may contain `$(...)` placeholders
    #[serde(default)]
    pub args: Vec<String>,

    /// Directories created under the state root before start
    #[serde(default)]
    pub required_dirs: IndexSet<String>,

    /// Environment defaults, each overridable by a same-named variable
    #[serde(default)]
    pub env: IndexMap<String, ArgValue>,

    /// How to decide that a freshly started process accepts work
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub readiness: ReadinessCheck,

    /// Per-service override of the readiness deadline (in milliseconds)
    #[serde(default)]
    pub readiness_timeout_ms: Option<u64>,

    /// Working directory for the process (default: project root)
    #[serde(default)]
    pub working_dir: Option<String>,

    /// One-shot bootstrap command run before the first start
    #[serde(default)]
    pub init: Option<InitStep>,
}

/// Readiness check definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessCheck {
    /// A TCP connection to `host:port` succeeds
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        port: ArgValue,
    },
    /// An HTTP GET returns a 2xx status
    Http { url: String },
    /// A file exists
    File { path: String },
    /// Ready as soon as the process is spawned
    #[default]
    None,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Bootstrap command run when `creates` is absent under the state root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitStep {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Path relative to the state root whose presence marks the init as done
    pub creates: String,
}

impl ProfilesFile {
    /// Load profiles from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ProfileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse profiles from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ProfileError> {
        let mut profiles: ProfilesFile =
            serde_yaml::from_str(content).map_err(ProfileError::Parse)?;
        for (name, profile) in profiles.services.iter_mut() {
            profile.name = name.clone();
        }
        profiles.validate()?;
        Ok(profiles)
    }

    /// Profiles for the services this tool knows out of the box
    pub fn builtin() -> Result<Self, ProfileError> {
        Self::from_yaml(BUILTIN_PROFILES)
    }

    /// Validate the profiles file
    pub fn validate(&self) -> Result<(), ProfileError> {
        self.supervisor.validate()?;

        for (name, profile) in &self.services {
            if name.trim().is_empty() {
                return Err(ProfileError::Validation(
                    "service names cannot be empty".to_string(),
                ));
            }
            if name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(ProfileError::Validation(format!(
                    "Service '{}': name must not contain path separators or start with '.'",
                    name
                )));
            }
            if profile.binary.trim().is_empty() {
                return Err(ProfileError::Validation(format!(
                    "Service '{}': 'binary' cannot be empty",
                    name
                )));
            }

            for (key, value) in &profile.env {
                if value.as_str().is_empty() {
                    return Err(ProfileError::Validation(format!(
                        "Service '{}': env default '{}' cannot be empty",
                        name, key
                    )));
                }
            }

            for dir in &profile.required_dirs {
                if !is_plain_relative(dir) {
                    return Err(ProfileError::Validation(format!(
                        "Service '{}': required dir '{}' must be a relative path inside the state root",
                        name, dir
                    )));
                }
            }

            if let Some(init) = &profile.init {
                if init.binary.trim().is_empty() {
                    return Err(ProfileError::Validation(format!(
                        "Service '{}': init 'binary' cannot be empty",
                        name
                    )));
                }
                if !is_plain_relative(&init.creates) {
                    return Err(ProfileError::Validation(format!(
                        "Service '{}': init 'creates' must be a relative path inside the state root",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up a service profile by name
    pub fn get(&self, name: &str) -> Option<&ServiceProfile> {
        self.services.get(name)
    }

    /// All service names in declaration order
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

/// Non-empty, relative, and never escaping upwards
fn is_plain_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Errors that can occur when loading a profiles file
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Failed to read profiles file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse profiles file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_parse() {
        let profiles = ProfilesFile::builtin().unwrap();
        assert!(profiles.get("postgres").is_some());
        assert!(profiles.get("grafana").is_some());
        assert_eq!(profiles.get("postgres").unwrap().name, "postgres");
        assert!(matches!(
            profiles.get("postgres").unwrap().readiness,
            ReadinessCheck::Tcp { .. }
        ));
        assert!(matches!(
            profiles.get("grafana").unwrap().readiness,
            ReadinessCheck::Http { .. }
        ));
    }

    #[test]
    fn test_parse_service_profile() {
        let yaml = r#"
services:
  db:
    binary: bin/db
    args: ["--port", "$(env PORT)"]
    required_dirs: [data, logs]
    env:
      PORT: 5432
      VERBOSE: true
    readiness:
      tcp:
        port: "$(env PORT)"
"#;
        let profiles = ProfilesFile::from_yaml(yaml).unwrap();
        let db = profiles.get("db").unwrap();
        assert_eq!(db.name, "db");
        assert_eq!(db.args, vec!["--port", "$(env PORT)"]);
        assert_eq!(db.required_dirs.len(), 2);
        assert_eq!(db.env["PORT"].as_str(), "5432");
        assert_eq!(db.env["VERBOSE"].as_str(), "true");
        assert_eq!(
            db.readiness,
            ReadinessCheck::Tcp {
                host: "127.0.0.1".to_string(),
                port: ArgValue::String("$(env PORT)".to_string()),
            }
        );
        assert_eq!(profiles.supervisor, SupervisorSettings::default());
    }

    #[test]
    fn test_readiness_defaults_to_none() {
        let yaml = r#"
services:
  worker:
    binary: worker
"#;
        let profiles = ProfilesFile::from_yaml(yaml).unwrap();
        assert_eq!(profiles.get("worker").unwrap().readiness, ReadinessCheck::None);
    }

    #[test]
    fn test_readiness_none_as_plain_value() {
        let yaml = r#"
services:
  worker:
    binary: worker
    readiness: none
"#;
        let profiles = ProfilesFile::from_yaml(yaml).unwrap();
        assert_eq!(profiles.get("worker").unwrap().readiness, ReadinessCheck::None);
    }

    #[test]
    fn test_http_and_file_readiness() {
        let yaml = r#"
services:
  dash:
    binary: dash
    readiness:
      http:
        url: "http://127.0.0.1:3000/api/health"
  marker:
    binary: marker
    readiness:
      file:
        path: "$(dir run)/ready"
"#;
        let profiles = ProfilesFile::from_yaml(yaml).unwrap();
        assert!(matches!(
            profiles.get("dash").unwrap().readiness,
            ReadinessCheck::Http { .. }
        ));
        assert!(matches!(
            profiles.get("marker").unwrap().readiness,
            ReadinessCheck::File { .. }
        ));
    }

    #[test]
    fn test_validation_empty_env_default() {
        let yaml = r#"
services:
  db:
    binary: db
    env:
      PORT: ""
"#;
        assert!(matches!(
            ProfilesFile::from_yaml(yaml),
            Err(ProfileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_escaping_required_dir() {
        for dir in ["/abs/data", "../outside", "data/../../x"] {
            let yaml = format!(
                "services:\n  db:\n    binary: db\n    required_dirs: [\"{}\"]\n",
                dir
            );
            assert!(
                ProfilesFile::from_yaml(&yaml).is_err(),
                "dir '{}' should be rejected",
                dir
            );
        }
    }

    #[test]
    fn test_validation_bad_readiness_settings() {
        let yaml = r#"
supervisor:
  readiness:
    initial_delay_ms: 6000
    max_delay_ms: 5000
services:
  db:
    binary: db
"#;
        assert!(ProfilesFile::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_names_keep_declaration_order() {
        let yaml = r#"
services:
  zeta:
    binary: z
  alpha:
    binary: a
"#;
        let profiles = ProfilesFile::from_yaml(yaml).unwrap();
        assert_eq!(profiles.names(), vec!["zeta", "alpha"]);
    }
}
