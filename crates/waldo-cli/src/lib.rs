//! Command surface for recording pipeline runs outside a host process.
//!
//! - `migrate` prepares the recorder tables next to an existing samples table.
//! - `record` replays lifecycle callbacks (JSON Lines) under one run id.
//! - `score` stores a batch of outlier scores under its context.
//! - `events` lists what was recorded for a run.
//!
//! Results go to stdout as JSON; logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waldo_domain::{
    parse_rfc3339_utc, ConnectionDescriptor, FailurePolicy, RunId, ScoreBatch, WaldoConfig,
    WaldoError,
};
use waldo_recorder::{
    Correlator, LoggingValidator, NumericColumnsValidator, RunSession, ValidatorRegistry,
};
use waldo_store_core::StorageGateway;
use waldo_store_sqlite::SqliteGateway;

/// File read from `--conf-dir`.
pub const CREDENTIALS_FILE: &str = "credentials.yml";
/// Environment variable overriding the configured connection URI.
pub const CON_ENV: &str = "WALDO_CON";

#[derive(Debug, Parser)]
#[command(name = "waldo")]
#[command(about = "Pipeline run recorder")]
pub struct Cli {
    #[arg(long, default_value = "conf/base")]
    conf_dir: PathBuf,

    /// Connection URI; wins over the credentials file and `WALDO_CON`.
    #[arg(long)]
    con: Option<String>,

    #[arg(long, value_enum, default_value_t = PolicyArg::Log)]
    policy: PolicyArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Record(RecordArgs),
    Score(InputArgs),
    Events(EventsArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Defaults to a fresh run id.
    #[arg(long)]
    run_id: Option<String>,
    /// JSON Lines file of callbacks, or `-` for stdin.
    #[arg(long, default_value = "-")]
    input: String,
    #[arg(long = "validator", value_enum)]
    validators: Vec<ValidatorArg>,
}

#[derive(Debug, Args)]
pub struct InputArgs {
    /// JSON file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    input: String,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    Log,
    Propagate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ValidatorArg {
    Logging,
    Numeric,
}

/// One line of `record` input.
#[derive(Debug, Deserialize)]
struct CallbackLine {
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when configuration, migration, input parsing or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(&cli.conf_dir, cli.con.as_deref())?;
    let policy = map_policy(cli.policy);

    match cli.command {
        Command::Migrate => {
            open_migrated(&config)?;
            println!("{}", serde_json::to_string_pretty(&json!({"status": "ok"}))?);
            Ok(())
        }
        Command::Record(args) => run_record(open_migrated(&config)?, policy, &args),
        Command::Score(args) => run_score(open_migrated(&config)?, &args),
        Command::Events(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let gateway = SqliteGateway::from_config(&config)?;
            let events = gateway
                .list_events_for_run(run_id)
                .context("failed to list events; run `waldo migrate` first")?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
    }
}

/// Opens the configured database and applies the schema.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated. An
/// in-memory database never holds the samples table, so that case says so.
pub fn open_migrated(config: &WaldoConfig) -> Result<SqliteGateway> {
    let mut gateway = SqliteGateway::from_config(config)?;
    match gateway.migrate() {
        Ok(()) => Ok(gateway),
        Err(err @ WaldoError::Configuration(_))
            if matches!(config.connection(), Ok(ConnectionDescriptor::SqliteMemory)) =>
        {
            Err(anyhow!(
                "{err}: `{}` is an in-memory database, which cannot hold the `{}` table; \
                 set `con` in {CREDENTIALS_FILE}, {CON_ENV} or --con",
                config.con,
                config.samples.table
            ))
        }
        Err(err) => Err(err.into()),
    }
}

/// Resolves the effective configuration: credentials file, then
/// `WALDO_CON`, then `--con`.
///
/// # Errors
/// Returns an error when the credentials file exists but cannot be read or parsed.
pub fn load_config(conf_dir: &Path, con: Option<&str>) -> Result<WaldoConfig> {
    let path = conf_dir.join(CREDENTIALS_FILE);
    let mut config = match std::fs::read_to_string(&path) {
        Ok(text) => WaldoConfig::from_yaml_str(&text)
            .with_context(|| format!("failed to load {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                "credentials file not found; using an in-memory database"
            );
            WaldoConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    if let Ok(value) = std::env::var(CON_ENV) {
        if !value.trim().is_empty() {
            config = config.with_con(value);
        }
    }
    if let Some(value) = con {
        config = config.with_con(value);
    }
    Ok(config)
}

fn run_record(gateway: SqliteGateway, policy: FailurePolicy, args: &RecordArgs) -> Result<()> {
    let run_id = match args.run_id.as_deref() {
        Some(raw) => parse_run_id(raw)?,
        None => RunId::new(),
    };
    let validators = args
        .validators
        .iter()
        .fold(ValidatorRegistry::new(), |registry, validator| match validator {
            ValidatorArg::Logging => registry.with(LoggingValidator::new()),
            ValidatorArg::Numeric => registry.with(NumericColumnsValidator::new()),
        });

    let input = read_input(&args.input)?;
    let mut session = RunSession::new(gateway)
        .with_run_id(run_id)
        .with_policy(policy)
        .with_validators(validators);

    let mut recorded = 0_usize;
    let mut failed = 0_usize;
    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let callback: CallbackLine = serde_json::from_str(line)
            .with_context(|| format!("line {line_no}: invalid callback JSON"))?;
        let timestamp = callback
            .timestamp
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .with_context(|| format!("line {line_no}: invalid timestamp"))?;

        let outcome = session
            .dispatch_callback(&callback.event_type, callback.payload, timestamp)
            .with_context(|| format!("line {line_no}: {} not recorded", callback.event_type))?;
        if outcome.is_some() {
            recorded += 1;
        } else {
            failed += 1;
        }
    }

    info!(run_id = %run_id, recorded, failed, "callbacks replayed");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_id": run_id.to_string(),
            "recorded": recorded,
            "failed": failed,
        }))?
    );
    Ok(())
}

fn run_score(gateway: SqliteGateway, args: &InputArgs) -> Result<()> {
    let input = read_input(&args.input)?;
    let batch: ScoreBatch =
        serde_json::from_str(&input).context("score input must be a JSON score batch")?;

    let mut correlator = Correlator::new(gateway);
    let context_id = correlator.record_scores(&batch)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "context_id": context_id.0,
            "rows": batch.scores.len(),
        }))?
    );
    Ok(())
}

fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("failed to read {source}"))
    }
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).map_err(|err| anyhow!("invalid --run-id: {err}"))
}

fn map_policy(policy: PolicyArg) -> FailurePolicy {
    match policy {
        PolicyArg::Log => FailurePolicy::LogAndContinue,
        PolicyArg::Propagate => FailurePolicy::Propagate,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use waldo_domain::{RunId, DEFAULT_CON};

    use super::{load_config, Cli, Command};

    fn temp_conf_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("waldo-cli-{name}-{}", RunId::new()));
        if let Err(err) = std::fs::create_dir_all(&dir) {
            panic!("failed to create {}: {err}", dir.display());
        }
        dir
    }

    #[test]
    fn missing_credentials_fall_back_to_defaults() {
        let dir = temp_conf_dir("missing");
        let config = match load_config(&dir, None) {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:#}"),
        };
        if std::env::var(super::CON_ENV).is_err() {
            assert_eq!(config.con, DEFAULT_CON);
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn flag_overrides_credentials_file() {
        let dir = temp_conf_dir("override");
        if let Err(err) = std::fs::write(
            dir.join(super::CREDENTIALS_FILE),
            "waldo:\n  con: sqlite:///from-file.db\n  busy_timeout_ms: 250\n",
        ) {
            panic!("failed to write credentials: {err}");
        }

        let config = match load_config(&dir, Some("/tmp/from-flag.db")) {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:#}"),
        };
        assert_eq!(config.con, "/tmp/from-flag.db");
        assert_eq!(config.busy_timeout_ms, 250);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_credentials_are_reported() {
        let dir = temp_conf_dir("malformed");
        if let Err(err) = std::fs::write(dir.join(super::CREDENTIALS_FILE), "waldo: [unclosed") {
            panic!("failed to write credentials: {err}");
        }
        assert!(load_config(&dir, None).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn record_arguments_parse() {
        let cli = match Cli::try_parse_from([
            "waldo",
            "--policy",
            "propagate",
            "record",
            "--run-id",
            "11111111-1111-1111-1111-111111111111",
            "--validator",
            "numeric",
            "--input",
            "events.jsonl",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse: {err}"),
        };
        match cli.command {
            Command::Record(args) => {
                assert_eq!(args.input, "events.jsonl");
                assert_eq!(args.validators.len(), 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
