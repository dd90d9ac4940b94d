//! Command-line surface and subcommand dispatch.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use seeker_db::{
    create_pool, MigrationError, MigrationManager, MigrationStatus, PoolError, QueryExecutor,
};
use thiserror::Error;

use crate::config::{Config, ConfigError};

/// Seeker database migration tool.
#[derive(Debug, Parser)]
#[command(name = "seeker-migrate", version)]
#[command(about = "Seeker database migration tool")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "SEEKER_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configuration.
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Migrations directory, overriding the configuration.
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Apply pending migrations in version order.
    Up {
        /// Stop after applying this version.
        #[arg(long)]
        target: Option<String>,
    },
    /// Roll back applied migrations, newest first.
    Down {
        /// Keep this version and everything below it applied.
        #[arg(long)]
        target: Option<String>,
    },
    /// Show applied and pending migrations.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Write a new, empty migration script.
    Create {
        /// Label for the migration, e.g. "add user roles".
        #[arg(long)]
        name: String,
        /// Also write an empty rollback script.
        #[arg(long)]
        with_rollback: bool,
    },
}

impl Cli {
    /// Applies the command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(database) = &self.database {
            config.database.path = database.clone();
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.clone();
        }
    }
}

/// Errors surfaced by the CLI.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The database could not be opened.
    #[error("failed to open database: {0}")]
    Pool(#[from] PoolError),

    /// A migration operation failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Writing to the output stream failed.
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),

    /// The status could not be encoded as JSON.
    #[error("failed to encode status: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opens the configured database, runs `command`, and closes the pool.
///
/// Human-readable results are written to `out`.
///
/// # Errors
///
/// Returns `CommandError` if the database cannot be opened, the migration
/// operation fails, or `out` cannot be written.
pub fn run<W: Write>(command: &Command, config: &Config, out: &mut W) -> Result<(), CommandError> {
    let pool = create_pool(&config.database.path, config.database.runtime_settings())?;
    tracing::debug!(path = %config.database.path, "database opened");

    let result = MigrationManager::new(
        QueryExecutor::new(pool.clone()),
        config.migrations.settings(),
    )
    .map_err(CommandError::from)
    .and_then(|manager| dispatch(&manager, command, out));

    pool.close_all();
    result
}

fn dispatch<W: Write>(
    manager: &MigrationManager,
    command: &Command,
    out: &mut W,
) -> Result<(), CommandError> {
    match command {
        Command::Up { target } => {
            let report = manager.migrate_up(target.as_deref())?;
            if report.applied.is_empty() {
                writeln!(out, "No pending migrations")?;
            } else {
                for version in &report.applied {
                    writeln!(out, "Applied {version}")?;
                }
                writeln!(out, "Applied {} migration(s)", report.applied.len())?;
            }
        }
        Command::Down { target } => {
            let report = manager.migrate_down(target.as_deref())?;
            if report.reverted.is_empty() {
                writeln!(out, "Nothing to roll back")?;
            } else {
                for version in &report.reverted {
                    writeln!(out, "Rolled back {version}")?;
                }
                writeln!(out, "Rolled back {} migration(s)", report.reverted.len())?;
            }
        }
        Command::Status { json } => {
            let status = manager.status()?;
            if *json {
                serde_json::to_writer_pretty(&mut *out, &status)?;
                writeln!(out)?;
            } else {
                render_status(&status, out)?;
            }
        }
        Command::Create {
            name,
            with_rollback,
        } => {
            let created = manager.create_migration(name, *with_rollback)?;
            writeln!(out, "Created {}", created.path.display())?;
            if let Some(rollback) = &created.rollback {
                writeln!(out, "Created {}", rollback.display())?;
            }
        }
    }
    Ok(())
}

/// Writes the plain-text status report.
pub fn render_status<W: Write>(status: &MigrationStatus, out: &mut W) -> io::Result<()> {
    writeln!(out, "Applied migrations: {}", status.applied.len())?;
    for record in &status.applied {
        writeln!(
            out,
            "  [x] {}  {}  ({})",
            record.version, record.name, record.applied_at
        )?;
    }

    writeln!(out, "Pending migrations: {}", status.pending.len())?;
    for file in &status.pending {
        writeln!(out, "  [ ] {}  {}", file.version, file.name)?;
    }

    for drift in &status.drift {
        writeln!(
            out,
            "WARNING: migration {} ({}) changed after it was applied: recorded {}, now {}",
            drift.version, drift.name, drift.recorded, drift.current
        )?;
    }
    for version in &status.missing_files {
        writeln!(
            out,
            "WARNING: migration {version} is applied but its script is missing"
        )?;
    }
    Ok(())
}
