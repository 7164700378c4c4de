//! Command-line interface for devsvc

use crate::orchestrator::Action;
use argh::FromArgs;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default profiles file looked up in the project root
pub const DEFAULT_PROFILES_FILE: &str = "devsvc.yaml";

/// Provision and supervise local development services
#[derive(FromArgs, Debug)]
pub struct CliArgs {
    /// service name as declared in the profiles file (e.g. postgres, grafana)
    #[argh(positional)]
    pub service: String,

    /// action to run: start, stop, restart, status
    #[argh(positional, from_str_fn(parse_action))]
    pub action: Action,

    /// profiles file (default: devsvc.yaml in the project root, else built-in profiles)
    #[argh(option, short = 'p')]
    pub profiles: Option<PathBuf>,

    /// project root (default: $DEVSVC_PROJECT_ROOT or the current directory)
    #[argh(option, short = 'C')]
    pub project_root: Option<PathBuf>,

    /// override a service variable (format: KEY=VALUE, repeatable)
    #[argh(option, short = 'e', from_str_fn(parse_env_override))]
    pub env: Vec<(String, String)>,

    /// seconds to wait after SIGTERM before SIGKILL (default: 10)
    #[argh(option, short = 'g', default = "10", from_str_fn(parse_grace_timeout))]
    pub grace_timeout: u64,

    /// status output format: table or json (default: table)
    #[argh(option, short = 'f', default = "String::from(\"table\")")]
    pub format: String,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

fn parse_action(s: &str) -> Result<Action, String> {
    s.parse()
}

/// Parse an override in format "KEY=VALUE"
fn parse_env_override(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!(
            "Invalid override format '{}'. Expected 'KEY=VALUE'",
            s
        )),
    }
}

fn parse_grace_timeout(s: &str) -> Result<u64, String> {
    s.parse()
        .map_err(|_| format!("Invalid grace timeout '{}'. Expected whole seconds", s))
}

impl CliArgs {
    /// Overrides as a map; later occurrences of a key win
    pub fn env_overrides(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_timeout)
    }

    /// `--project-root`, then `DEVSVC_PROJECT_ROOT`, then the current directory
    pub fn resolve_project_root(&self) -> std::io::Result<PathBuf> {
        if let Some(root) = &self.project_root {
            return Ok(root.clone());
        }
        match std::env::var("DEVSVC_PROJECT_ROOT") {
            Ok(root) if !root.is_empty() => Ok(PathBuf::from(root)),
            _ => std::env::current_dir(),
        }
    }

    /// Explicit profiles file, if any: `--profiles`, `DEVSVC_PROFILES`, or `devsvc.yaml` in the project root
    pub fn resolve_profiles_path(&self, project_root: &std::path::Path) -> Option<PathBuf> {
        if let Some(path) = &self.profiles {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var("DEVSVC_PROFILES") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let default = project_root.join(DEFAULT_PROFILES_FILE);
        default.is_file().then_some(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_override() {
        let result = parse_env_override("PORT=5433");
        assert_eq!(result, Ok(("PORT".to_string(), "5433".to_string())));
    }

    #[test]
    fn test_parse_env_override_with_equals_in_value() {
        let result = parse_env_override("URL=postgres://u@h/db?sslmode=disable");
        assert_eq!(
            result,
            Ok((
                "URL".to_string(),
                "postgres://u@h/db?sslmode=disable".to_string()
            ))
        );
    }

    #[test]
    fn test_parse_env_override_invalid() {
        assert!(parse_env_override("PORT").is_err());
        assert!(parse_env_override("=5433").is_err());
    }

    #[test]
    fn test_parse_env_override_keeps_empty_value() {
        // Rejected later by the resolver, with a config error
        assert_eq!(
            parse_env_override("PORT="),
            Ok(("PORT".to_string(), String::new()))
        );
    }

    #[test]
    fn test_parse_args() {
        let args = CliArgs::from_args(
            &["devsvc"],
            &["postgres", "start", "-e", "PGPORT=5433", "-g", "3", "-C", "/work/app"],
        )
        .unwrap();
        assert_eq!(args.service, "postgres");
        assert_eq!(args.action, Action::Start);
        assert_eq!(args.env_overrides()["PGPORT"], "5433");
        assert_eq!(args.grace(), Duration::from_secs(3));
        assert_eq!(args.resolve_project_root().unwrap(), PathBuf::from("/work/app"));
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_parse_args_rejects_unknown_action() {
        assert!(CliArgs::from_args(&["devsvc"], &["postgres", "reload"]).is_err());
    }

    #[test]
    fn test_explicit_profiles_path_wins() {
        let args = CliArgs::from_args(
            &["devsvc"],
            &["grafana", "status", "-p", "custom.yaml"],
        )
        .unwrap();
        assert_eq!(
            args.resolve_profiles_path(std::path::Path::new("/nonexistent")),
            Some(PathBuf::from("custom.yaml"))
        );
    }

    #[test]
    fn test_default_profiles_file_in_project_root() {
        let project = tempfile::tempdir().unwrap();
        let args = CliArgs::from_args(&["devsvc"], &["grafana", "status"]).unwrap();

        // DEVSVC_PROFILES may be set in the environment running the tests
        if std::env::var_os("DEVSVC_PROFILES").is_some() {
            return;
        }
        assert_eq!(args.resolve_profiles_path(project.path()), None);

        std::fs::write(project.path().join(DEFAULT_PROFILES_FILE), "services: {}\n").unwrap();
        assert_eq!(
            args.resolve_profiles_path(project.path()),
            Some(project.path().join(DEFAULT_PROFILES_FILE))
        );
    }
}
