//! `$(kind arg)` placeholder expansion for profile values

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Upper bound on nested expansion passes
const MAX_PASSES: usize = 10;

/// `$(kind argument)` or `$(kind)`
static SUBSTITUTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\((\w+)\s+([^)]+)\)|\$\((\w+)\)").expect("substitution pattern is valid")
});

/// Values available to `$(...)` placeholders
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Service environment (effective values)
    pub env: HashMap<String, String>,
    /// Inherited environment consulted after `env`; `None` reads the process environment
    pub inherited: Option<HashMap<String, String>>,
    /// Service name
    pub service: Option<String>,
    /// Project root directory
    pub project_root: Option<PathBuf>,
    /// Per-service state root
    pub state_root: Option<PathBuf>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one service variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Set several service variables at once
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Use an explicit inherited environment instead of the process one
    pub fn with_inherited(mut self, inherited: HashMap<String, String>) -> Self {
        self.inherited = Some(inherited);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn with_state_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.state_root = Some(root.into());
        self
    }

    /// Expand every placeholder in `input`
    ///
    /// Expanded values may themselves contain placeholders, so expansion is
    /// repeated until the text is stable, at most [`MAX_PASSES`] times.
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();
        for _ in 0..MAX_PASSES {
            if !SUBSTITUTION_PATTERN.is_match(&current) {
                return Ok(current);
            }
            let next = self.expand_pass(&current)?;
            if next == current {
                return Ok(next);
            }
            current = next;
        }

        if SUBSTITUTION_PATTERN.is_match(&current) {
            return Err(SubstitutionError::MaxIterationsExceeded(input.to_string()));
        }
        Ok(current)
    }

    /// Expand the placeholders present in `input`, without recursing
    fn expand_pass(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut first_error = None;
        let expanded = SUBSTITUTION_PATTERN.replace_all(input, |caps: &Captures| {
            if first_error.is_some() {
                return String::new();
            }
            self.expand_capture(caps).unwrap_or_else(|e| {
                first_error = Some(e);
                String::new()
            })
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(expanded.into_owned()),
        }
    }

    fn expand_capture(&self, caps: &Captures) -> Result<String, SubstitutionError> {
        match (caps.get(1), caps.get(2), caps.get(3)) {
            // $(kind argument), e.g. $(dir data)
            (Some(kind), Some(arg), _) => self.expand(kind.as_str(), arg.as_str().trim()),
            // $(kind), e.g. $(state_root)
            (_, _, Some(kind)) => self.expand(kind.as_str(), ""),
            _ => Err(SubstitutionError::InvalidPattern(caps[0].to_string())),
        }
    }

    fn expand(&self, kind: &str, arg: &str) -> Result<String, SubstitutionError> {
        match kind {
            "env" => self.lookup_env(arg),
            "dir" => {
                let root = self
                    .state_root
                    .as_ref()
                    .ok_or(SubstitutionError::MissingContext("state_root"))?;
                Ok(root.join(arg).to_string_lossy().into_owned())
            }
            "state_root" => path_string(self.state_root.as_ref(), "state_root"),
            "project_root" => path_string(self.project_root.as_ref(), "project_root"),
            "service" => self
                .service
                .clone()
                .ok_or(SubstitutionError::MissingContext("service")),
            "timestamp" => Ok(format_now(arg, "%Y%m%d_%H%M%S")),
            "date" => Ok(format_now(arg, "%Y-%m-%d")),
            _ => Err(SubstitutionError::UnknownType(kind.to_string())),
        }
    }

    /// Service environment first, then the inherited one
    fn lookup_env(&self, name: &str) -> Result<String, SubstitutionError> {
        if let Some(value) = self.env.get(name) {
            return Ok(value.clone());
        }
        let inherited = match &self.inherited {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var(name).ok(),
        };
        inherited.ok_or_else(|| SubstitutionError::UndefinedEnv(name.to_string()))
    }
}

fn path_string(path: Option<&PathBuf>, what: &'static str) -> Result<String, SubstitutionError> {
    path.map(|p| p.to_string_lossy().into_owned())
        .ok_or(SubstitutionError::MissingContext(what))
}

/// Local time, in `format` or `default` when `format` is empty
fn format_now(format: &str, default: &str) -> String {
    let format = if format.is_empty() { default } else { format };
    chrono::Local::now().format(format).to_string()
}

/// Placeholder expansion failures
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown placeholder type '{0}'")]
    UnknownType(String),

    #[error("Variable '{0}' is not defined")]
    UndefinedEnv(String),

    #[error("No {0} available for substitution")]
    MissingContext(&'static str),

    #[error("Malformed placeholder '{0}'")]
    InvalidPattern(String),

    #[error("Placeholders in '{0}' do not settle (self-referencing?)")]
    MaxIterationsExceeded(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hermetic() -> SubstitutionContext {
        SubstitutionContext::new().with_inherited(HashMap::new())
    }

    #[test]
    fn test_env_placeholder_uses_service_env() {
        let ctx = hermetic().with_env("PORT", "5432");

        let result = ctx.substitute("--port=$(env PORT)").unwrap();
        assert_eq!(result, "--port=5432");
    }

    #[test]
    fn test_env_falls_back_to_inherited() {
        let inherited = HashMap::from([("HOME".to_string(), "/home/dev".to_string())]);
        let ctx = SubstitutionContext::new()
            .with_inherited(inherited)
            .with_env("PORT", "5432");

        assert_eq!(ctx.substitute("$(env HOME)").unwrap(), "/home/dev");
        assert!(matches!(
            ctx.substitute("$(env MISSING)"),
            Err(SubstitutionError::UndefinedEnv(_))
        ));
    }

    #[test]
    fn test_dir_and_roots() {
        let ctx = hermetic()
            .with_service("postgres")
            .with_project_root("/work/app")
            .with_state_root("/work/app/.postgres");

        assert_eq!(
            ctx.substitute("$(dir data)").unwrap(),
            "/work/app/.postgres/data"
        );
        assert_eq!(
            ctx.substitute("$(state_root)").unwrap(),
            "/work/app/.postgres"
        );
        assert_eq!(ctx.substitute("$(project_root)").unwrap(), "/work/app");
        assert_eq!(ctx.substitute("$(service).log").unwrap(), "postgres.log");
    }

    #[test]
    fn test_dir_without_state_root() {
        let ctx = hermetic();
        assert!(matches!(
            ctx.substitute("$(dir data)"),
            Err(SubstitutionError::MissingContext("state_root"))
        ));
    }

    #[test]
    fn test_timestamp_has_default_format() {
        let ctx = hermetic();

        let result = ctx.substitute("server_$(timestamp).log").unwrap();
        assert!(result.starts_with("server_"));
        assert!(result.ends_with(".log"));
        assert!(result.len() > 15);
    }

    #[test]
    fn test_values_expand_recursively() {
        let ctx = hermetic()
            .with_env("URL", "http://localhost:$(env PORT)")
            .with_env("PORT", "3000");

        let result = ctx.substitute("$(env URL)/api/health").unwrap();
        assert_eq!(result, "http://localhost:3000/api/health");
    }

    #[test]
    fn test_self_reference_is_bounded() {
        let ctx = hermetic().with_env("LOOP", "x$(env LOOP)");
        assert!(matches!(
            ctx.substitute("$(env LOOP)"),
            Err(SubstitutionError::MaxIterationsExceeded(_))
        ));
    }

    #[test]
    fn test_unknown_placeholder_kind() {
        let ctx = hermetic();
        assert!(matches!(
            ctx.substitute("$(arg config)"),
            Err(SubstitutionError::UnknownType(_))
        ));
    }

    #[test]
    fn test_text_without_placeholders_is_unchanged() {
        let ctx = hermetic();

        let result = ctx.substitute("plain string").unwrap();
        assert_eq!(result, "plain string");
    }
}
