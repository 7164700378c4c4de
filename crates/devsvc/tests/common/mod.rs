//! Test helpers: shell-script services and fast supervision policies

#![allow(dead_code)]

use devsvc::{ReadinessPolicy, ReadinessProbe, ResolvedConfig, SupervisorPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Readiness polling fast enough for tests
pub fn fast_readiness(timeout_ms: u64) -> ReadinessPolicy {
    ReadinessPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        attempt_timeout: Duration::from_millis(200),
        timeout: Duration::from_millis(timeout_ms),
    }
}

/// Supervision policy with short delays
pub fn fast_policy(max_restarts: u32) -> SupervisorPolicy {
    SupervisorPolicy {
        max_restarts,
        restart_window: Duration::from_secs(30),
        restart_delay: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
        readiness: fast_readiness(2_000),
    }
}

/// A service that runs `script` with `/bin/sh -c` inside its state root
pub fn sh_service(state_root: &Path, name: &str, script: &str) -> ResolvedConfig {
    std::fs::create_dir_all(state_root).expect("create state root");
    ResolvedConfig {
        service_name: name.to_string(),
        binary: PathBuf::from("/bin/sh"),
        effective_env: Default::default(),
        effective_args: vec!["-c".to_string(), script.to_string()],
        state_root: state_root.to_path_buf(),
        required_dirs: Default::default(),
        readiness: ReadinessProbe::None,
        readiness_timeout: None,
        working_dir: state_root.to_path_buf(),
        init: None,
    }
}

/// Readiness on a file that nothing creates
pub fn never_ready(state_root: &Path) -> ReadinessProbe {
    ReadinessProbe::File {
        path: state_root.join("never-ready"),
    }
}

/// Poll `check` every 20ms until it holds or `timeout` elapses
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Number of lines in a file, zero if it does not exist
pub fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
