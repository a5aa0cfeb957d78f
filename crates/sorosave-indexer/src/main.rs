//! SoroSave indexer binary: opens and migrates the index database, then
//! reports on it.
//!
//! ```text
//! sorosave-indexer [config.toml] [status|verify]
//! ```
//!
//! `status` (the default) prints aggregate statistics as JSON.
//! `verify` recomputes member counts and savings totals from the underlying
//! rows and exits non-zero if any stored aggregate disagrees.

use std::process::ExitCode;
use std::sync::Arc;

use sorosave_indexer::config::{self, Config};
use sorosave_projection::{MemberIndex, Projector, QueryService};
use tracing_subscriber::EnvFilter;

/// What the binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Verify,
}

impl Command {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "status" => Some(Self::Status),
            "verify" => Some(Self::Verify),
            _ => None,
        }
    }
}

/// Splits argv into an optional config path and a command. A lone argument
/// that names a command is a command, anything else is the config path.
fn parse_args(args: &[String]) -> Result<(Option<String>, Command), String> {
    match args {
        [] => Ok((None, Command::Status)),
        [one] => match Command::parse(one) {
            Some(command) => Ok((None, command)),
            None => Ok((Some(one.clone()), Command::Status)),
        },
        [path, command] => Command::parse(command)
            .map(|command| (Some(path.clone()), command))
            .ok_or_else(|| format!("unknown command: {command}")),
        _ => Err("usage: sorosave-indexer [config.toml] [status|verify]".to_string()),
    }
}

fn resolve_config_path(cli_path: Option<String>) -> (Option<String>, &'static str) {
    if let Some(path) = cli_path.filter(|value| !value.trim().is_empty()) {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SOROSAVE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn run(config: &Config, command: Command) -> Result<bool, BoxError> {
    let pool = sorosave_db::create_pool(&config.database.path, config.db_settings())?;

    {
        let conn = pool.get()?;
        let applied = sorosave_db::run_migrations(&conn)?;
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let index = Arc::new(MemberIndex::new());
    let projector = Projector::new(pool.clone(), Arc::clone(&index));
    let memberships = projector.rebuild_index()?;
    tracing::info!(
        memberships,
        addresses = index.len(),
        "member index loaded"
    );

    let queries = QueryService::new(pool, index);

    match command {
        Command::Status => {
            let stats = queries.get_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(true)
        }
        Command::Verify => {
            let report = queries.check_consistency()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                tracing::warn!("projection aggregates drifted from underlying rows");
            }
            Ok(report.is_consistent())
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let (resolved_config_path, config_source) = resolve_config_path(cli_path);
    let selected_config_path = resolved_config_path.as_deref().or(Some("sorosave.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        ?command,
        "resolved startup configuration path"
    );

    match run(&config, command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "indexer command failed");
            ExitCode::FAILURE
        }
    }
}
