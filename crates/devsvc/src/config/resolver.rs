//! Merge profile defaults, inherited environment, and explicit overrides

use crate::config::{ReadinessCheck, ServiceProfile, SubstitutionContext, SubstitutionError};
use crate::runtime::ReadinessProbe;
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Final configuration for one service invocation
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub service_name: String,
    /// Absolute path of the executable
    pub binary: PathBuf,
    /// Every declared env key with its final value
    pub effective_env: IndexMap<String, String>,
    pub effective_args: Vec<String>,
    /// `<project_root>/.<service_name>`
    pub state_root: PathBuf,
    pub required_dirs: IndexSet<String>,
    pub readiness: ReadinessProbe,
    /// Per-service readiness deadline, if the profile sets one
    pub readiness_timeout: Option<Duration>,
    pub working_dir: PathBuf,
    pub init: Option<ResolvedInit>,
}

/// Bootstrap command with placeholders expanded
#[derive(Debug, Clone)]
pub struct ResolvedInit {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Absolute path whose presence marks the init as done
    pub creates: PathBuf,
}

/// Builds [`ResolvedConfig`] values
///
/// Precedence, highest first: explicit overrides, inherited environment,
/// profile defaults.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    environment: HashMap<String, String>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver reading the current process environment
    pub fn new() -> Self {
        Self {
            environment: std::env::vars().collect(),
        }
    }

    /// Resolver using an explicit environment instead of the process one
    pub fn with_environment(environment: HashMap<String, String>) -> Self {
        Self { environment }
    }

    /// State root for a service: always `<project_root>/.<service_name>`
    pub fn state_root(project_root: &Path, service_name: &str) -> PathBuf {
        project_root.join(format!(".{}", service_name))
    }

    /// Resolve a profile into its final configuration
    pub fn resolve(
        &self,
        profile: &ServiceProfile,
        overrides: &HashMap<String, String>,
        project_root: &Path,
    ) -> Result<ResolvedConfig, ConfigError> {
        for (key, value) in overrides {
            if !profile.env.contains_key(key) {
                return Err(ConfigError::UnknownOverride(key.clone()));
            }
            if value.is_empty() {
                return Err(ConfigError::EmptyOverride(key.clone()));
            }
        }

        let state_root = Self::state_root(project_root, &profile.name);

        // Apply precedence; values are still unexpanded here
        let mut raw: IndexMap<String, String> = IndexMap::new();
        for (key, default) in &profile.env {
            let value = overrides
                .get(key)
                .or_else(|| self.environment.get(key).filter(|v| !v.is_empty()))
                .cloned()
                .unwrap_or_else(|| default.as_str());
            raw.insert(key.clone(), value);
        }

        let base_ctx = SubstitutionContext::new()
            .with_inherited(self.environment.clone())
            .with_service(profile.name.clone())
            .with_project_root(project_root)
            .with_state_root(&state_root);

        let raw_ctx = base_ctx.clone().with_envs(raw.clone());
        let mut effective_env = IndexMap::new();
        for (key, value) in &raw {
            let resolved = raw_ctx
                .substitute(value)
                .map_err(|e| ConfigError::Substitution {
                    context: format!("env '{}'", key),
                    source: e,
                })?;
            effective_env.insert(key.clone(), resolved);
        }

        // Hard invariant: every declared key ends up with a value
        for key in profile.env.keys() {
            match effective_env.get(key) {
                Some(value) if !value.is_empty() => {}
                _ => return Err(ConfigError::Unresolved(key.clone())),
            }
        }

        let ctx = base_ctx.with_envs(effective_env.clone());

        let effective_args = substitute_all(&ctx, &profile.args, "args")?;
        let readiness = self.resolve_readiness(&ctx, &profile.readiness)?;

        let working_dir = match &profile.working_dir {
            Some(dir) => {
                let dir = substitute(&ctx, dir, "working_dir")?;
                project_root.join(dir)
            }
            None => project_root.to_path_buf(),
        };

        let binary = self.locate_binary(&substitute(&ctx, &profile.binary, "binary")?, project_root)?;

        let init = match &profile.init {
            Some(init) => {
                let init_binary =
                    self.locate_binary(&substitute(&ctx, &init.binary, "init binary")?, project_root)?;
                Some(ResolvedInit {
                    binary: init_binary,
                    args: substitute_all(&ctx, &init.args, "init args")?,
                    creates: state_root.join(&init.creates),
                })
            }
            None => None,
        };

        Ok(ResolvedConfig {
            service_name: profile.name.clone(),
            binary,
            effective_env,
            effective_args,
            state_root,
            required_dirs: profile.required_dirs.clone(),
            readiness,
            readiness_timeout: profile.readiness_timeout_ms.map(Duration::from_millis),
            working_dir,
            init,
        })
    }

    fn resolve_readiness(
        &self,
        ctx: &SubstitutionContext,
        check: &ReadinessCheck,
    ) -> Result<ReadinessProbe, ConfigError> {
        Ok(match check {
            ReadinessCheck::Tcp { host, port } => {
                let host = substitute(ctx, host, "readiness host")?;
                let port = substitute(ctx, &port.as_str(), "readiness port")?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidReadiness(format!("invalid port '{}'", port)))?;
                ReadinessProbe::Tcp {
                    addr: format!("{}:{}", host, port),
                }
            }
            ReadinessCheck::Http { url } => {
                let url = substitute(ctx, url, "readiness url")?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidReadiness(format!(
                        "url '{}' must start with http:// or https://",
                        url
                    )));
                }
                ReadinessProbe::Http { url }
            }
            ReadinessCheck::File { path } => {
                let path = substitute(ctx, path, "readiness path")?;
                ReadinessProbe::File {
                    path: PathBuf::from(path),
                }
            }
            ReadinessCheck::None => ReadinessProbe::None,
        })
    }

    /// Find the executable: paths are taken relative to the project root, bare names go through PATH
    fn locate_binary(&self, binary: &str, project_root: &Path) -> Result<PathBuf, ConfigError> {
        let candidate = Path::new(binary);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            let path = project_root.join(candidate);
            if !path.exists() {
                return Err(ConfigError::BinaryNotFound(binary.to_string()));
            }
            if !is_executable(&path) {
                return Err(ConfigError::NotExecutable(path));
            }
            return Ok(path);
        }

        let search_path = self.environment.get("PATH").cloned().unwrap_or_default();
        for dir in std::env::split_paths(&search_path) {
            let path = dir.join(binary);
            if is_executable(&path) {
                return Ok(path);
            }
        }
        Err(ConfigError::BinaryNotFound(binary.to_string()))
    }
}

fn substitute(
    ctx: &SubstitutionContext,
    input: &str,
    context: &str,
) -> Result<String, ConfigError> {
    ctx.substitute(input)
        .map_err(|e| ConfigError::Substitution {
            context: context.to_string(),
            source: e,
        })
}

fn substitute_all(
    ctx: &SubstitutionContext,
    inputs: &[String],
    context: &str,
) -> Result<Vec<String>, ConfigError> {
    inputs
        .iter()
        .map(|input| substitute(ctx, input, context))
        .collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Errors that can occur while resolving a service configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Override for undeclared variable '{0}'")]
    UnknownOverride(String),

    #[error("Override for '{0}' is empty")]
    EmptyOverride(String),

    #[error("Variable '{0}' has no value after resolution")]
    Unresolved(String),

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Binary '{0}' not found")]
    BinaryNotFound(String),

    #[error("Binary '{}' is not executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("Invalid readiness check: {0}")]
    InvalidReadiness(String),
}
