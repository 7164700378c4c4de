//! devsvc CLI
//!
//! Usage:
//!   devsvc postgres start
//!   devsvc postgres start -e PGPORT=5433
//!   devsvc grafana status -f json
//!   devsvc postgres stop -g 30

use devsvc::error::{profile_exit_code, EXIT_CANCELLED, EXIT_FAILURE};
use devsvc::{
    CliArgs, Orchestrator, OrchestratorConfig, OrchestratorError, Outcome, ProfilesFile,
    ServiceState,
};
use std::time::UNIX_EPOCH;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: CliArgs = argh::from_env();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    let project_root = match args.resolve_project_root() {
        Ok(root) => root,
        Err(e) => {
            log::error!("Failed to determine project root: {}", e);
            std::process::exit(EXIT_FAILURE);
        }
    };

    let profiles = match args.resolve_profiles_path(&project_root) {
        Some(path) => {
            log::debug!("Loading profiles file: {}", path.display());
            ProfilesFile::from_file(&path)
        }
        None => ProfilesFile::builtin(),
    };
    let profiles = match profiles {
        Ok(profiles) => profiles,
        Err(e) => {
            log::error!("Failed to load profiles: {}", e);
            std::process::exit(profile_exit_code(&e));
        }
    };

    let config = OrchestratorConfig {
        project_root,
        overrides: args.env_overrides(),
        grace_timeout: args.grace(),
    };
    let mut orchestrator = Orchestrator::new(profiles, config);

    // Fired by the signal handler
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    // Ctrl+C and SIGTERM both stop the service gracefully
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received termination signal, initiating shutdown...");
        let _ = shutdown_tx.send(());
    }) {
        log::error!("Failed to install signal handler: {}", e);
        std::process::exit(EXIT_FAILURE);
    }

    let outcome = tokio::select! {
        outcome = orchestrator.run(&args.service, args.action) => outcome,
        _ = shutdown_rx.changed() => {
            log::info!("[{}] {} interrupted", args.service, args.action);
            orchestrator.shutdown().await;
            std::process::exit(EXIT_CANCELLED);
        }
    };
    let handle = match outcome {
        Ok(Outcome::Started(handle)) => handle,
        Ok(Outcome::Stopped { was_running }) => {
            if was_running {
                println!("{}: stopped", args.service);
            } else {
                println!("{}: not running", args.service);
            }
            return;
        }
        Ok(Outcome::Status(state)) => {
            print_status(&args.service, &state, &args.format);
            return;
        }
        Err(e) => {
            let code = report_failure(&mut orchestrator, e).await;
            std::process::exit(code);
        }
    };

    println!(
        "{}: running (pid {})",
        args.service,
        handle.state().pid.unwrap_or(0)
    );

    let result = orchestrator.supervise(shutdown_rx).await;
    orchestrator.shutdown().await;

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
    log::info!("devsvc exiting");
}

/// Report a failed action and return its exit code
async fn report_failure(orchestrator: &mut Orchestrator, err: OrchestratorError) -> i32 {
    orchestrator.abandon(&err).await;
    eprintln!("{}", err);
    err.exit_code()
}

fn print_status(service: &str, state: &ServiceState, format: &str) {
    let started_at = state.started_at.map(|t| {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        chrono::DateTime::from_timestamp(secs, 0)
            .map(|dt| dt.with_timezone(&chrono::Local).to_rfc3339())
            .unwrap_or_default()
    });

    if format == "json" {
        let value = serde_json::json!({
            "service": service,
            "status": state.status.as_str(),
            "pid": state.pid,
            "started_at": started_at,
            "restart_count": state.restart_count,
        });
        println!("{}", value);
        return;
    }

    println!("{:<12} {:<10} {:<8} {:<26} RESTARTS", "SERVICE", "STATUS", "PID", "STARTED");
    println!(
        "{:<12} {:<10} {:<8} {:<26} {}",
        service,
        state.status.as_str(),
        state.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        started_at.unwrap_or_else(|| "-".to_string()),
        state.restart_count
    );
}
