use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stories_application::config::render_sample;
use stories_application::db::{DatabaseUrl, StatementLog};
use stories_application::{
    ConfigError, DbError, Engine, MigrationError, Migrator, OfflineScript, ScriptDirectory,
    StoriesConfig,
};
use thiserror::Error;

mod logging;

#[derive(Error, Debug)]
pub enum ManageError {
    #[error("Configuration error")]
    ConfigError(#[from] ConfigError),
    #[error("Database error")]
    DbError(#[from] DbError),
    #[error("Migration error")]
    MigrationError(#[from] MigrationError),
    #[error("I/O error")]
    IOError(#[from] std::io::Error),
    #[error("Log setup error")]
    LogSetupError(#[from] tracing_subscriber::filter::ParseError),
    #[error("Log setup error")]
    LogSetup2Error(#[from] tracing_subscriber::filter::FromEnvError),
    #[error("Invalid arguments: {0}")]
    ArgumentsInvalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "stories-db-manage", about = "Manage the story tracking database schema")]
struct Args {
    #[arg(
        long,
        value_name = "PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Configuration file, may be repeated (later files override earlier ones)"
    )]
    config_file: Vec<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "LOG",
        help = "Logging filter (overrides STORIES_LOG environment variable)"
    )]
    log: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Database connection string (overrides [database] connection)"
    )]
    database_connection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the revision the database is at
    Current,
    /// List every revision, newest first
    History {
        #[arg(long, help = "Mark the revision the database is at")]
        indicate_current: bool,
    },
    /// Show the head revision
    Heads,
    /// Validate the revision chain
    Check,
    /// Upgrade the database to a later revision
    Upgrade {
        #[arg(value_name = "REVISION", conflicts_with = "delta", help = "Target revision (default: head)")]
        revision: Option<String>,

        #[arg(long, value_name = "N", help = "Number of revisions to apply")]
        delta: Option<usize>,

        #[arg(long, help = "Print the SQL instead of running it")]
        sql: bool,
    },
    /// Revert the database to an earlier revision
    Downgrade {
        #[arg(
            value_name = "REVISION",
            conflicts_with = "delta",
            required_unless_present = "delta",
            help = "Target revision, or <start>:<end> with --sql"
        )]
        revision: Option<String>,

        #[arg(long, value_name = "N", help = "Number of revisions to revert")]
        delta: Option<usize>,

        #[arg(long, help = "Print the SQL instead of running it")]
        sql: bool,
    },
    /// Record a revision as current without running any migration
    Stamp {
        #[arg(value_name = "REVISION")]
        revision: String,

        #[arg(long, help = "Print the SQL instead of running it")]
        sql: bool,
    },
    /// Print a sample configuration file
    SampleConfig,
}

/// A relative target from `--delta`, or the explicit revision.
fn target(revision: Option<String>, delta: Option<usize>, sign: char) -> Option<String> {
    delta.map(|n| format!("{}{}", sign, n)).or(revision)
}

fn offline<'a>(
    config: &'a StoriesConfig,
    scripts: &'a ScriptDirectory,
) -> Result<OfflineScript<'a>, ManageError> {
    let url = DatabaseUrl::parse(&config.database.connection)?;
    Ok(
        OfflineScript::new(scripts, url.dialect(), &config.database.mysql_engine)
            .with_statements(StatementLog::from_config(&config.database)),
    )
}

fn run(command: Command, config: &StoriesConfig, out: &mut impl Write) -> Result<(), ManageError> {
    let scripts = ScriptDirectory::stories()?;
    let head = scripts.head().revision();
    match command {
        Command::SampleConfig => write!(out, "{}", render_sample())?,
        Command::History { indicate_current } => {
            let entries = if indicate_current {
                let engine = Engine::from_config(&config.database)?;
                Migrator::new(&engine, scripts).history()?
            } else {
                scripts.history(None)
            };
            for entry in entries {
                writeln!(out, "{}", entry)?;
            }
        }
        Command::Heads => writeln!(out, "{} (head)", head)?,
        Command::Check => writeln!(
            out,
            "No problems detected: {} revision(s), head is {}",
            scripts.len(),
            head
        )?,
        Command::Current => {
            let engine = Engine::from_config(&config.database)?;
            match Migrator::new(&engine, scripts).current()? {
                Some(revision) if revision == head => writeln!(out, "{} (head)", revision)?,
                Some(revision) => writeln!(out, "{}", revision)?,
                None => writeln!(out, "base")?,
            }
        }
        Command::Upgrade {
            revision,
            delta,
            sql,
        } => {
            let target = target(revision, delta, '+').unwrap_or_else(|| "head".into());
            if sql {
                write!(out, "{}", offline(config, &scripts)?.upgrade(&target)?)?;
            } else {
                let engine = Engine::from_config(&config.database)?;
                let applied = Migrator::new(&engine, scripts).upgrade(&target)?;
                if applied.is_empty() {
                    tracing::info!("Database is already at {}", target);
                }
            }
        }
        Command::Downgrade {
            revision,
            delta,
            sql,
        } => {
            let target = target(revision, delta, '-').ok_or_else(|| {
                ManageError::ArgumentsInvalid("downgrade needs a revision or --delta".into())
            })?;
            if sql {
                write!(out, "{}", offline(config, &scripts)?.downgrade(&target)?)?;
            } else {
                let engine = Engine::from_config(&config.database)?;
                let reverted = Migrator::new(&engine, scripts).downgrade(&target)?;
                if reverted.is_empty() {
                    tracing::info!("Database is already at {}", target);
                }
            }
        }
        Command::Stamp { revision, sql } => {
            if sql {
                write!(out, "{}", offline(config, &scripts)?.stamp(&revision)?)?;
            } else {
                let engine = Engine::from_config(&config.database)?;
                Migrator::new(&engine, scripts).stamp(&revision)?;
            }
        }
    }
    Ok(())
}

/// Our entry point.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    go()?;
    Ok(())
}

fn go() -> Result<(), ManageError> {
    let args = Args::parse();

    let mut config = StoriesConfig::load(&args.config_file)?;
    logging::init(args.log.as_deref(), &config.default)?;
    if let Some(connection) = args.database_connection {
        tracing::info!("Using the database connection given on the command line");
        config.set_database_connection(connection);
    }
    config.log_values();

    let stdout = std::io::stdout();
    run(args.command, &config, &mut stdout.lock())
}
