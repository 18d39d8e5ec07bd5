//! Command surface for the corpus tooling.
//!
//! The CLI validates the requested (oracle, version, dialect) selection
//! through the registry before opening any engine connection, so an
//! unsupported pairing exits nonzero with no partial state. Engine
//! lifecycle stays external: `predict` expects an already-running instance
//! behind `--engine-dsn` or `--psql-command`.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sqlverdict_core::{validate_selection, Dialect, Oracle, OracleIdentity, OracleKind};
use sqlverdict_oracles::{
    display_name, DoBlockOracle, DriverOracle, PgQueryOracle, PsqlCommand, PsqlOracle,
};
use sqlverdict_scheduler::{bulk_predict, PredictOptions, ProgressFn};
use sqlverdict_store_sqlite::SqliteCorpusStore;

#[derive(Debug, Parser)]
#[command(name = "sqlverdict")]
#[command(about = "Have oracles opine on whether corpus statements are valid SQL")]
pub struct Cli {
    /// Path to the corpus database.
    #[arg(long, default_value = "./corpus.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one oracle over every pending statement of a dialect.
    Predict(PredictArgs),
    /// List the oracle variants and the versions they support.
    ListOracles(ListOraclesArgs),
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    #[arg(long, default_value = "pgsql")]
    dialect: DialectArg,
    #[arg(long)]
    oracle: OracleArg,
    /// Target engine version; must be supported by the chosen oracle.
    #[arg(long, default_value = "14")]
    version: String,
    /// Connection string of the running engine (raw and do-block oracles).
    #[arg(long)]
    engine_dsn: Option<String>,
    /// Launch line for the interactive client (psql oracle), split on
    /// whitespace, e.g. "docker-compose exec -T psql".
    #[arg(long)]
    psql_command: Option<String>,
    /// Override the worker-count policy.
    #[arg(long)]
    workers: Option<usize>,
    /// Print the plan without running the oracle.
    #[arg(long)]
    dry_run: bool,
    /// Suppress the progress counter even when stderr is a terminal.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Debug, Args)]
pub struct ListOraclesArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DialectArg {
    Other,
    Pgsql,
    Plpgsql,
    Psql,
    Plperl,
    Pltcl,
    Plpython2,
    Plpython3,
    Sqlite,
}

impl From<DialectArg> for Dialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Other => Self::Other,
            DialectArg::Pgsql => Self::Pgsql,
            DialectArg::Plpgsql => Self::Plpgsql,
            DialectArg::Psql => Self::Psql,
            DialectArg::Plperl => Self::Plperl,
            DialectArg::Pltcl => Self::Pltcl,
            DialectArg::Plpython2 => Self::Plpython2,
            DialectArg::Plpython3 => Self::Plpython3,
            DialectArg::Sqlite => Self::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OracleArg {
    Raw,
    DoBlock,
    Psql,
    /// Keeps the registry spelling rather than clap's kebab-case.
    #[value(name = "pg_query")]
    PgQuery,
}

impl From<OracleArg> for OracleKind {
    fn from(value: OracleArg) -> Self {
        match value {
            OracleArg::Raw => Self::Raw,
            OracleArg::DoBlock => Self::DoBlock,
            OracleArg::Psql => Self::Psql,
            OracleArg::PgQuery => Self::PgQuery,
        }
    }
}

/// Executes the parsed top-level command graph.
///
/// # Errors
/// Returns an error for unsupported oracle selections, store failures, and
/// aborted prediction runs.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Predict(args) => run_predict(&cli.db, &args),
        Command::ListOracles(args) => run_list_oracles(&args),
    }
}

fn run_predict(db: &Path, args: &PredictArgs) -> Result<()> {
    let kind = OracleKind::from(args.oracle);
    let dialect = Dialect::from(args.dialect);
    // Fail fast: no engine work, no store writes, for a bad pairing.
    validate_selection(kind, &args.version, dialect)?;

    let store = SqliteCorpusStore::open(db)?;
    store.migrate()?;

    if args.dry_run {
        let identity = OracleIdentity::new(display_name(kind, &args.version));
        let pending = store.pending_statements(dialect, identity.id)?;
        let plan = serde_json::json!({
            "dry_run": true,
            "oracle_id": identity.id,
            "oracle_name": identity.name,
            "dialect": dialect.as_str(),
            "pending": pending.len(),
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let oracle = build_oracle(kind, args)?;
    let options = PredictOptions {
        workers: args.workers,
        progress: progress_sink(args.no_progress),
    };
    let report = bulk_predict(&store, oracle.as_ref(), dialect, options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_oracle(kind: OracleKind, args: &PredictArgs) -> Result<Box<dyn Oracle + Sync>> {
    match kind {
        OracleKind::Raw => {
            let dsn = args
                .engine_dsn
                .as_deref()
                .ok_or_else(|| anyhow!("--engine-dsn is required for the raw oracle"))?;
            Ok(Box::new(DriverOracle::connect(&args.version, dsn)?))
        }
        OracleKind::DoBlock => {
            let dsn = args
                .engine_dsn
                .as_deref()
                .ok_or_else(|| anyhow!("--engine-dsn is required for the do-block oracle"))?;
            Ok(Box::new(DoBlockOracle::connect(&args.version, dsn)?))
        }
        OracleKind::Psql => {
            let raw = args
                .psql_command
                .as_deref()
                .ok_or_else(|| anyhow!("--psql-command is required for the psql oracle"))?;
            let command = PsqlCommand::parse(raw)?;
            Ok(Box::new(PsqlOracle::new(&args.version, command)))
        }
        OracleKind::PgQuery => Ok(Box::new(PgQueryOracle::new())),
    }
}

/// Progress counter on stderr, rendered only for interactive sessions
/// unless suppressed.
fn progress_sink(no_progress: bool) -> Option<ProgressFn> {
    if no_progress || !std::io::stderr().is_terminal() {
        return None;
    }
    Some(Box::new(|done, total| {
        eprint!("\r{done}/{total} predictions persisted");
        if done == total {
            eprintln!();
        }
    }))
}

fn run_list_oracles(args: &ListOraclesArgs) -> Result<()> {
    if args.json {
        let rows: Vec<serde_json::Value> = OracleKind::ALL
            .iter()
            .map(|kind| {
                serde_json::json!({
                    "oracle": kind.as_str(),
                    "versions": kind.supported_versions(),
                    "dialects": kind
                        .supported_dialects()
                        .iter()
                        .map(|dialect| dialect.as_str())
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:>10} {:<20}", "oracle", "versions");
    for kind in OracleKind::ALL {
        println!(
            "{:>10} {:<20}",
            kind.as_str(),
            kind.supported_versions().join(", ")
        );
    }
    Ok(())
}
