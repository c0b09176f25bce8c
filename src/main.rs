//! migrate CLI
//!
//! Entry point for the command-line tool.
//!
//! Exit codes:
//! - 0: Success, or nothing to do
//! - 1: A migration failed, or the run was refused (checksum mismatch,
//!   out-of-order migration, missing migration, lock held, invalid reference)
//! - 2: Tool error (bad arguments, unknown target, config or load error)

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use schema_migrate::driver::{DbError, SqliteDatabase};
use schema_migrate::input::{self, MigrationLoader, MigrationSet, TomlLoader};
use schema_migrate::lock::MigrationLock;
use schema_migrate::output::OutputFormat;
use schema_migrate::runner::{Direction, RunError};
use schema_migrate::{Config, DialectKind, DownTarget, MigrationRunner, diff_with_renames, logging};

/// Default config file name used when --config is not explicitly provided.
const DEFAULT_CONFIG_FILE: &str = "migrate.toml";

#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(about = "Apply, revert and plan schema migrations", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides [database] path
    #[arg(long, global = true, env = "MIGRATE_DATABASE")]
    database: Option<PathBuf>,

    /// Migrations directory, overrides [migrations] dir
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// Override output format (text, json)
    #[arg(long, global = true, value_parser = str::parse::<OutputFormat>)]
    format: Option<OutputFormat>,

    /// Log filter used when RUST_LOG is unset (e.g. info, debug)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations
    Up {
        /// Stop after this migration id
        #[arg(long)]
        to: Option<String>,

        /// Apply pending migrations older than the newest applied one
        #[arg(long)]
        allow_out_of_order: bool,
    },

    /// Revert applied migrations (one step by default)
    Down(DownArgs),

    /// Show applied, pending and changed migrations
    Status,

    /// Create an empty migration file
    Create {
        /// Migration name, e.g. AddClasses
        name: String,
    },

    /// Print the SQL a run would execute without touching a database
    Script {
        /// Treat migrations up to and including this id as applied
        #[arg(long)]
        from: Option<String>,

        /// Stop at this migration id
        #[arg(long)]
        to: Option<String>,

        /// Target dialect, overrides [database] dialect
        #[arg(long, value_parser = str::parse::<DialectKind>)]
        dialect: Option<DialectKind>,

        /// Script a revert instead of an apply
        #[arg(long)]
        down: bool,
    },

    /// Write a migration that turns the local migrations into a desired schema
    Diff {
        /// Desired schema file
        #[arg(long)]
        schema: PathBuf,

        /// Migration name
        name: String,
    },

    /// Force-release a stale migration lock
    Unlock,
}

#[derive(ClapArgs, Debug)]
struct DownArgs {
    /// Revert down to, but not including, this migration id
    #[arg(long, conflicts_with_all = ["steps", "all"])]
    to: Option<String>,

    /// Number of migrations to revert
    #[arg(long, conflicts_with = "all")]
    steps: Option<usize>,

    /// Revert every applied migration
    #[arg(long)]
    all: bool,
}

impl DownArgs {
    fn target(&self) -> DownTarget {
        match (&self.to, self.steps, self.all) {
            (Some(id), _, _) => DownTarget::To(id.clone()),
            (None, _, true) => DownTarget::All,
            (None, Some(steps), false) => DownTarget::Steps(steps),
            (None, None, false) => DownTarget::default(),
        }
    }
}

fn main() {
    let args = Args::parse();

    match run(args) {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(exit_code(&err));
        }
    }
}

/// Refused or failed runs exit 1; everything else is a tool error.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(run_error) = err.downcast_ref::<RunError>() {
        run_error.exit_code()
    } else if err.downcast_ref::<DbError>().is_some() {
        1
    } else {
        2
    }
}

/// Run one command and return the process exit code.
fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args.config)?;
    if let Some(path) = args.database {
        config.database.path = path;
    }
    if let Some(dir) = args.migrations {
        config.migrations.dir = dir;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    logging::init(&config.logging.level, config.logging.json);

    let reporter = config.output.format.reporter();
    let mut stdout = std::io::stdout().lock();

    match args.command {
        Command::Up {
            to,
            allow_out_of_order,
        } => {
            let runner = build_runner(&config)?
                .allow_out_of_order(allow_out_of_order || config.migrations.allow_out_of_order);
            let mut db = open_database(&config)?;
            let report = runner.up(&mut db, to.as_deref())?;
            reporter
                .run(&report, &mut stdout)
                .context("Failed to write report")?;
            Ok(report.exit_code())
        }
        Command::Down(down) => {
            let runner = build_runner(&config)?;
            let mut db = open_database(&config)?;
            let report = runner.down(&mut db, &down.target())?;
            reporter
                .run(&report, &mut stdout)
                .context("Failed to write report")?;
            Ok(report.exit_code())
        }
        Command::Status => {
            let runner = build_runner(&config)?;
            let mut db = open_database(&config)?;
            let report = runner.status(&mut db)?;
            reporter
                .status(&report, &mut stdout)
                .context("Failed to write report")?;
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Command::Create { name } => {
            let path = input::scaffold(&config.migrations.dir, &name, Utc::now())
                .context("Failed to create migration")?;
            info!(path = %path.display(), "created migration");
            reporter
                .created(&path, 0, &mut stdout)
                .context("Failed to write report")?;
            Ok(0)
        }
        Command::Script {
            from,
            to,
            dialect,
            down,
        } => {
            let runner = build_runner(&config)?;
            let dialect = dialect.unwrap_or(config.database.dialect).dialect();
            let direction = if down { Direction::Down } else { Direction::Up };
            let script = runner.script(dialect, direction, from.as_deref(), to.as_deref())?;
            stdout
                .write_all(script.as_bytes())
                .context("Failed to write script")?;
            Ok(0)
        }
        Command::Diff { schema, name } => {
            let runner = build_runner(&config)?;
            let current = runner.local_catalog()?;
            let (desired, hints) = input::load_desired_schema(&schema)
                .context("Failed to load desired schema")?;
            let operations = diff_with_renames(&current, &desired, &hints)
                .context("Failed to plan schema changes")?;
            if operations.is_empty() {
                eprintln!("migrate: schema is up to date, no migration written");
                return Ok(0);
            }
            let count = operations.len();
            let description = format!("Generated from {}", schema.display());
            let path = input::write_migration(
                &config.migrations.dir,
                &name,
                Utc::now(),
                operations,
                Some(description),
            )
            .context("Failed to write migration")?;
            info!(path = %path.display(), operations = count, "wrote migration");
            reporter
                .created(&path, count, &mut stdout)
                .context("Failed to write report")?;
            Ok(0)
        }
        Command::Unlock => {
            let mut db = open_database(&config)?;
            let lock = MigrationLock::new(config.migrations.lock_table.as_str());
            let previous = lock.force_release(&mut db)?;
            reporter
                .unlocked(previous.as_deref(), &mut stdout)
                .context("Failed to write report")?;
            Ok(0)
        }
    }
}

/// Load configuration from file.
///
/// If `config_path` is `Some`, the user explicitly passed `--config` and the file
/// must exist (error if not found). If `None`, the default config path is used;
/// a missing default config file is not an error and falls back to defaults.
fn load_config(config_path: &Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::from_file(path).context("Failed to load configuration")
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                Config::from_file(&default_path).context("Failed to load configuration")
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn load_migrations(dir: &Path) -> Result<MigrationSet> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "migrations directory not found, treating as empty");
        return MigrationSet::new(Vec::new()).context("Failed to load migrations");
    }
    TomlLoader::new()
        .load(&[dir.to_path_buf()])
        .context("Failed to load migrations")
}

fn build_runner(config: &Config) -> Result<MigrationRunner> {
    let migrations = load_migrations(&config.migrations.dir)?;
    Ok(MigrationRunner::new(migrations)
        .history_table(config.migrations.history_table.as_str())
        .lock_table(config.migrations.lock_table.as_str()))
}

/// Only SQLite databases can be opened directly; other dialects are scripted.
fn open_database(config: &Config) -> Result<SqliteDatabase> {
    if config.database.dialect != DialectKind::Sqlite {
        anyhow::bail!(
            "no driver for dialect '{}'; use `migrate script --dialect {}` to generate SQL instead",
            config.database.dialect,
            config.database.dialect
        );
    }
    SqliteDatabase::open(&config.database.path, config.database.busy_timeout()).with_context(
        || format!("Failed to open database {}", config.database.path.display()),
    )
}
