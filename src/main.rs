//! multidb - Main entry point.
//!
//! Diagnostic CLI over the connection manager: list and probe the configured
//! backends, show manager statistics, and run ad-hoc statements.

use clap::Parser;
use multidb_manager::ConnectionManager;
use multidb_manager::config::{Command, Config};
use multidb_manager::models::QueryOutcome;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays parseable
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Pick `--env-file` out of the raw arguments.
///
/// The file has to be loaded before clap parses, or `MULTIDB_*` and `RUST_LOG`
/// values set in it would never reach the logging flags.
fn env_file_arg<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.to_str().and_then(|a| a.strip_prefix("--env-file=")) {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("MULTIDB_ENV_FILE").map(PathBuf::from)
}

/// Load the given file, or `.env` from the working directory when present.
fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, dotenvy::Error> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)?;
            Ok(Some(path.to_path_buf()))
        }
        None => match dotenvy::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(e),
        },
    }
}

async fn run(manager: &ConnectionManager, command: Command) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Command::Connections => {
            let reports = manager.connections_info().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(reports.values().all(|r| r.is_connected()))
        }
        Command::Test { name } => {
            let result = manager.test_connection(&name).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(result.success)
        }
        Command::Stats => {
            let stats = manager.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(true)
        }
        Command::Query {
            connection,
            format,
            sql,
        } => {
            let started = Instant::now();
            let outcome = manager.execute(&sql, &[], connection.as_deref()).await?;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                QueryOutcome::Rows { rows } => println!("{}", format.render(&rows, elapsed_ms)),
                other => println!("{}", serde_json::to_string_pretty(&other)?),
            }
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_file = load_env_file(env_file_arg(std::env::args_os()).as_deref());

    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    match env_file {
        Ok(Some(path)) => debug!(path = %path.display(), "Loaded environment file"),
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Failed to load environment file");
            return ExitCode::FAILURE;
        }
    }

    let manager = match ConnectionManager::from_env() {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        default = %manager.default_connection(),
        configured = manager.configured_connections().len(),
        "multidb v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = run(&manager, config.command).await;
    manager.close_all().await;

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Command failed");
            if let Some(suggestion) = e
                .downcast_ref::<multidb_manager::DbError>()
                .and_then(|e| e.suggestion())
            {
                eprintln!("Hint: {}", suggestion);
            }
            ExitCode::FAILURE
        }
    }
}
