//! Command-line entry point.
//!
//! # Responsibility
//! - Check core linkage (`ping`, `version`).
//! - Dispatch batch and anonymization bodies read from files against a
//!   local database, printing the response status and body.

use circstore_api::{init_logging, CirculationApi, RequestContext};
use circstore_core::db::open_db;
use circstore_core::{default_log_level, CoreLogger, LogEventPublisher, ServiceConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DB_FILE_NAME: &str = "circstore.sqlite3";

#[derive(Parser, Debug)]
#[command(name = "circstore")]
#[command(about = "Circulation storage: queue reordering and loan anonymization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Check that the core library is linked
    Ping,
    /// Print the core library version
    Version,
    /// Apply a request queue batch read from a JSON file
    Batch {
        /// Path to the `{"requests": [...]}` body
        body: PathBuf,
        /// SQLite database file
        #[arg(env = "CIRCSTORE_DB_PATH")]
        db: Option<PathBuf>,
    },
    /// Anonymize closed loans listed in a JSON file
    Anonymize {
        /// Path to the `{"loanIds": [...]}` body
        body: PathBuf,
        /// SQLite database file
        #[arg(env = "CIRCSTORE_DB_PATH")]
        db: Option<PathBuf>,
    },
}

#[derive(Clone, Copy)]
enum Endpoint {
    Batch,
    Anonymize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode, String> {
    match command {
        Command::Ping => {
            println!("circstore_core ping={}", circstore_api::ping());
            Ok(ExitCode::SUCCESS)
        }
        Command::Version => {
            println!("circstore_core version={}", circstore_api::core_version());
            Ok(ExitCode::SUCCESS)
        }
        Command::Batch { body, db } => dispatch(Endpoint::Batch, &body, db),
        Command::Anonymize { body, db } => dispatch(Endpoint::Anonymize, &body, db),
    }
}

fn dispatch(endpoint: Endpoint, body_path: &Path, db: Option<PathBuf>) -> Result<ExitCode, String> {
    setup_logging()?;
    let config = load_config()?;
    let body = std::fs::read_to_string(body_path)
        .map_err(|err| format!("cannot read {}: {err}", body_path.display()))?;
    let db_path = resolve_db_path(db);
    let conn = open_db(&db_path).map_err(|err| format!("db open failed: {err}"))?;

    let ctx = RequestContext {
        tenant_id: config.tenant_id.clone(),
        user_id: non_empty_env("CIRCSTORE_USER_ID"),
    };
    let logger = CoreLogger::process();
    let api = CirculationApi::new(config, LogEventPublisher::new(logger.clone()), logger);
    let response = match endpoint {
        Endpoint::Batch => api.post_requests_batch(&conn, &ctx, &body),
        Endpoint::Anonymize => api.post_anonymize_loans(&conn, &ctx, &body),
    };

    println!("status={}", response.status);
    if !response.body.is_empty() {
        println!("{}", response.body);
    }
    Ok(if response.status < 400 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Starts file logging when `CIRCSTORE_LOG_DIR` is set.
fn setup_logging() -> Result<(), String> {
    let Some(log_dir) = non_empty_env("CIRCSTORE_LOG_DIR") else {
        return Ok(());
    };
    let level =
        non_empty_env("CIRCSTORE_LOG_LEVEL").unwrap_or_else(|| default_log_level().to_string());
    let error = init_logging(&level, &log_dir);
    if error.is_empty() {
        Ok(())
    } else {
        Err(format!("logging init failed: {error}"))
    }
}

fn load_config() -> Result<ServiceConfig, String> {
    match non_empty_env("CIRCSTORE_CONFIG") {
        Some(path) => ServiceConfig::from_json_file(&path)
            .map_err(|err| format!("config load failed: {err}")),
        None => Ok(ServiceConfig::default()),
    }
}

/// Argument (or `CIRCSTORE_DB_PATH`, filled in by clap) first, temp dir last.
fn resolve_db_path(db: Option<PathBuf>) -> PathBuf {
    db.filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| std::env::temp_dir().join(DB_FILE_NAME))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}
