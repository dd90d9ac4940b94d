//! File-based SQL migration manager.
//!
//! Migrations live in a directory as `{NN}_{name}.sql` forward scripts and
//! optional `R{NN}_{name}.sql` (or `R{NN}.sql`) rollback scripts, where `NN`
//! is a zero-padded sequential integer. Applied versions are tracked in a
//! metadata table holding the version, a label, the SHA-256 of the script
//! at apply time, and a timestamp. Each migration and its tracking row are
//! committed in one transaction, so a failed script leaves the migration
//! pending with no partial schema changes.
//!
//! Migrations apply strictly in increasing version order. A pending version
//! below the highest applied version is an ordering error, never something
//! to skip over. Rolling back requires a rollback script for every version
//! being undone; the manager never guesses one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::params;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::DbError;
use crate::executor::QueryExecutor;

/// Default name of the tracking table.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// Default migrations directory, relative to the working directory.
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Where migrations are read from and recorded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    /// Directory holding the `.sql` scripts.
    pub dir: PathBuf,

    /// Name of the tracking table.
    pub table: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }
}

/// A forward migration script discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFile {
    /// Version exactly as written in the file name, e.g. `"03"`.
    pub version: String,
    /// Human label derived from the file name.
    pub name: String,
    /// Path to the forward script.
    pub path: PathBuf,
    /// Path to the paired rollback script, if one exists.
    pub rollback: Option<PathBuf>,
    #[serde(skip)]
    ordinal: u64,
}

impl MigrationFile {
    /// Numeric value of the version, used for ordering.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Applied version.
    pub version: String,
    /// Label recorded at apply time.
    pub name: String,
    /// SHA-256 hex digest of the script at apply time.
    pub checksum: String,
    /// UTC timestamp of the apply.
    pub applied_at: String,
    #[serde(skip)]
    ordinal: u64,
}

impl MigrationRecord {
    /// Numeric value of the version, used for ordering.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

/// An applied migration whose script changed after it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumDrift {
    /// Affected version.
    pub version: String,
    /// Label from the tracking table.
    pub name: String,
    /// Checksum stored at apply time.
    pub recorded: String,
    /// Checksum of the script on disk now.
    pub current: String,
}

/// Applied versus pending migrations, plus integrity findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Tracking rows, in version order.
    pub applied: Vec<MigrationRecord>,
    /// Scripts not yet applied, in version order.
    pub pending: Vec<MigrationFile>,
    /// Applied scripts whose content no longer matches the record.
    pub drift: Vec<ChecksumDrift>,
    /// Applied versions whose forward script is no longer on disk.
    pub missing_files: Vec<String>,
}

impl MigrationStatus {
    /// Whether no drift and no missing scripts were found.
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty() && self.missing_files.is_empty()
    }
}

/// Outcome of [`MigrationManager::migrate_up`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
}

/// Outcome of [`MigrationManager::migrate_down`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownReport {
    /// Versions rolled back by this run, highest first.
    pub reverted: Vec<String>,
}

/// Paths written by [`MigrationManager::create_migration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMigration {
    /// Version assigned to the new script.
    pub version: String,
    /// Forward script path.
    pub path: PathBuf,
    /// Rollback script path, when one was requested.
    pub rollback: Option<PathBuf>,
}

/// Errors raised while discovering, applying, or reverting migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A script or the migrations directory could not be read or written.
    #[error("migration file error at {}: {source}", .path.display())]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A version string is not a non-negative integer.
    #[error("invalid migration version '{0}'")]
    InvalidVersion(String),

    /// The tracking table name is not a plain identifier.
    #[error("invalid migrations table name '{0}'")]
    InvalidTable(String),

    /// A name passed to `create_migration` has no usable characters.
    #[error("invalid migration name '{0}'")]
    InvalidName(String),

    /// Two scripts of the same kind claim one version.
    #[error(
        "duplicate migration version {version}: {} and {}",
        .first.display(),
        .second.display()
    )]
    DuplicateVersion {
        /// The contested version.
        version: String,
        /// First script found.
        first: PathBuf,
        /// Second script found.
        second: PathBuf,
    },

    /// A pending version sorts below one that is already applied.
    #[error(
        "migration {version} is pending but {latest} is already applied; \
         migrations must be applied in increasing version order"
    )]
    OutOfOrder {
        /// The pending version.
        version: String,
        /// The highest applied version.
        latest: String,
    },

    /// A script or its tracking insert failed; the transaction was rolled back.
    #[error("migration {version} ({name}) failed: {source}")]
    Apply {
        /// Version that failed.
        version: String,
        /// Its label.
        name: String,
        /// Driver error.
        source: DbError,
    },

    /// A version that has to be undone has no rollback script.
    #[error("no rollback script found for migration {version}")]
    RollbackMissing {
        /// Version lacking a rollback script.
        version: String,
    },

    /// A rollback script or its tracking delete failed; rolled back.
    #[error("rollback of migration {version} failed: {source}")]
    Rollback {
        /// Version that failed to revert.
        version: String,
        /// Driver error.
        source: DbError,
    },

    /// A version was named that is not recorded as applied.
    #[error("migration {0} is not applied")]
    NotApplied(String),

    /// An applied script's content differs from what was recorded.
    #[error("checksum drift for migration {version}: recorded {recorded}, now {current}")]
    ChecksumDrift {
        /// Drifted version.
        version: String,
        /// Checksum stored at apply time.
        recorded: String,
        /// Checksum of the file now.
        current: String,
    },

    /// `create_migration` would overwrite an existing file.
    #[error("migration file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A batch stopped at `version`; versions in `completed` stay committed.
    #[error("stopped at migration {version} after {} succeeded: {source}", .completed.len())]
    Halted {
        /// Version the batch stopped at.
        version: String,
        /// Versions that completed before the failure.
        completed: Vec<String>,
        /// What went wrong with `version`.
        source: Box<MigrationError>,
    },

    /// Reading or bootstrapping the tracking table failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Forward,
    Rollback,
}

#[derive(Debug, PartialEq, Eq)]
struct ScriptName {
    kind: ScriptKind,
    ordinal: u64,
    version: String,
    label: String,
}

/// Parses `01_create_users.sql`, `R01_create_users.sql`, or `R01.sql`.
fn parse_script_name(file_name: &str) -> Option<ScriptName> {
    let stem = file_name.strip_suffix(".sql")?;
    let (kind, rest) = match stem.strip_prefix('R') {
        Some(rest) => (ScriptKind::Rollback, rest),
        None => (ScriptKind::Forward, stem),
    };

    let (version, label) = match rest.split_once('_') {
        Some((version, label)) => (version, label),
        None if kind == ScriptKind::Rollback => (rest, ""),
        None => return None,
    };

    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if kind == ScriptKind::Forward && label.is_empty() {
        return None;
    }

    Some(ScriptName {
        kind,
        ordinal: version.parse().ok()?,
        version: version.to_string(),
        label: label.replace('_', " "),
    })
}

fn parse_version(version: &str) -> Result<u64, MigrationError> {
    let trimmed = version.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MigrationError::InvalidVersion(version.to_string()));
    }
    trimmed
        .parse()
        .map_err(|_| MigrationError::InvalidVersion(version.to_string()))
}

/// SHA-256 of a script's bytes as lowercase hex.
pub fn checksum(contents: &[u8]) -> String {
    Sha256::digest(contents)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Lowercases and reduces a free-form name to `[a-z0-9_]`.
fn slugify(name: &str) -> Result<String, MigrationError> {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        return Err(MigrationError::InvalidName(name.to_string()));
    }
    Ok(slug)
}

fn is_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, MigrationError> {
    fs::read(path).map_err(|source| MigrationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn script_text(path: &Path, bytes: Vec<u8>) -> Result<String, MigrationError> {
    String::from_utf8(bytes).map_err(|e| MigrationError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

fn read_script(path: &Path) -> Result<String, MigrationError> {
    script_text(path, read_bytes(path)?)
}

fn write_new_file(path: &Path, contents: &str) -> Result<(), MigrationError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                MigrationError::AlreadyExists(path.to_path_buf())
            } else {
                MigrationError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
    file.write_all(contents.as_bytes())
        .map_err(|source| MigrationError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Scripts found in the migrations directory, keyed by version.
#[derive(Debug, Default)]
struct Scripts {
    forward: BTreeMap<u64, MigrationFile>,
    rollback: BTreeMap<u64, PathBuf>,
}

/// Discovers, applies, tracks, verifies, and rolls back migrations.
///
/// A single manager is assumed to run against a database at a time; the
/// tracking table relies on transactional isolation, not on a lock.
#[derive(Debug)]
pub struct MigrationManager {
    executor: QueryExecutor,
    dir: PathBuf,
    table: String,
    bootstrapped: AtomicBool,
}

impl MigrationManager {
    /// Creates a manager. Nothing touches the database until first use.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidTable` if the table name is not a
    /// plain SQL identifier.
    pub fn new(executor: QueryExecutor, settings: MigrationSettings) -> Result<Self, MigrationError> {
        if !is_identifier(&settings.table) {
            return Err(MigrationError::InvalidTable(settings.table));
        }
        Ok(Self {
            executor,
            dir: settings.dir,
            table: settings.table,
            bootstrapped: AtomicBool::new(false),
        })
    }

    /// The migrations directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The tracking table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the tracking table if it does not exist yet.
    ///
    /// Tracking rows cannot be updated once written; a trigger rejects it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the DDL fails.
    pub fn ensure_table(&self) -> Result<(), MigrationError> {
        if self.bootstrapped.load(Ordering::Acquire) {
            return Ok(());
        }

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                version TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE TRIGGER IF NOT EXISTS {table}_immutable
            BEFORE UPDATE ON {table}
            BEGIN
                SELECT RAISE(ABORT, 'migration records are immutable');
            END;",
            table = self.table
        );

        self.executor
            .with_transaction(|tx| -> Result<(), DbError> {
                tx.execute_batch(&ddl)?;
                Ok(())
            })?;

        self.bootstrapped.store(true, Ordering::Release);
        tracing::debug!(table = %self.table, "migration tracking table ready");
        Ok(())
    }

    fn scan(&self) -> Result<Scripts, MigrationError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(dir = %self.dir.display(), "migrations directory not found");
                return Ok(Scripts::default());
            }
            Err(source) => {
                return Err(MigrationError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut scripts = Scripts::default();
        for entry in entries {
            let entry = entry.map_err(|source| MigrationError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(parsed) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_script_name)
            else {
                tracing::trace!(path = %path.display(), "ignoring non-migration file");
                continue;
            };

            match parsed.kind {
                ScriptKind::Forward => {
                    if let Some(existing) = scripts.forward.get(&parsed.ordinal) {
                        return Err(MigrationError::DuplicateVersion {
                            version: parsed.version,
                            first: existing.path.clone(),
                            second: path,
                        });
                    }
                    scripts.forward.insert(
                        parsed.ordinal,
                        MigrationFile {
                            version: parsed.version,
                            name: parsed.label,
                            path,
                            rollback: None,
                            ordinal: parsed.ordinal,
                        },
                    );
                }
                ScriptKind::Rollback => {
                    if let Some(existing) = scripts.rollback.get(&parsed.ordinal) {
                        return Err(MigrationError::DuplicateVersion {
                            version: parsed.version,
                            first: existing.clone(),
                            second: path,
                        });
                    }
                    scripts.rollback.insert(parsed.ordinal, path);
                }
            }
        }

        for (ordinal, path) in &scripts.rollback {
            if let Some(file) = scripts.forward.get_mut(ordinal) {
                file.rollback = Some(path.clone());
            }
        }

        Ok(scripts)
    }

    /// Lists forward scripts in the migrations directory, lowest version
    /// first. A missing directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory cannot be read and
    /// `MigrationError::DuplicateVersion` if two scripts share a version.
    pub fn get_available_migrations(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        Ok(self.scan()?.forward.into_values().collect())
    }

    /// Reads the tracking table, lowest version first.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` on SQL failure and
    /// `MigrationError::InvalidVersion` for a non-numeric recorded version.
    pub fn get_applied_migrations(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.ensure_table()?;

        let rows = self.executor.execute_query(
            &format!(
                "SELECT version, name, checksum, applied_at FROM {}",
                self.table
            ),
            [],
        )?;

        let mut records = rows
            .iter()
            .map(|row| -> Result<MigrationRecord, MigrationError> {
                let version: String = row.get_as("version")?;
                Ok(MigrationRecord {
                    ordinal: parse_version(&version)?,
                    version,
                    name: row.get_as("name")?,
                    checksum: row.get_as("checksum")?,
                    applied_at: row.get_as("applied_at")?,
                })
            })
            .collect::<Result<Vec<_>, MigrationError>>()?;
        records.sort_by_key(|record| record.ordinal);
        Ok(records)
    }

    /// Scripts on disk that are not recorded as applied, lowest version
    /// first. Versions below the highest applied one are included; they are
    /// an ordering problem for [`MigrationManager::migrate_up`] to report.
    ///
    /// # Errors
    ///
    /// Propagates discovery and tracking-table errors.
    pub fn get_pending_migrations(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        let applied = self.get_applied_migrations()?;
        let available = self.get_available_migrations()?;
        Ok(pending_from(available, &applied))
    }

    /// Applies one script and records it, in a single transaction.
    ///
    /// An empty script is recorded without executing anything.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the script cannot be read and
    /// `MigrationError::Apply` if the SQL or the tracking insert fails. In
    /// the latter case nothing from the script is kept.
    pub fn apply_migration(&self, migration: &MigrationFile) -> Result<(), MigrationError> {
        self.ensure_table()?;

        let bytes = read_bytes(&migration.path)?;
        let sum = checksum(&bytes);
        let script = script_text(&migration.path, bytes)?;
        if script.trim().is_empty() {
            tracing::warn!(version = %migration.version, "migration script is empty, recording it anyway");
        }

        tracing::info!(version = %migration.version, name = %migration.name, "applying migration");

        let insert = format!(
            "INSERT INTO {} (version, name, checksum) VALUES (?1, ?2, ?3)",
            self.table
        );
        self.executor
            .with_transaction(|tx| -> Result<(), DbError> {
                tx.execute_batch(&script)?;
                tx.execute(&insert, params![migration.version, migration.name, sum])?;
                Ok(())
            })
            .map_err(|source| MigrationError::Apply {
                version: migration.version.clone(),
                name: migration.name.clone(),
                source,
            })?;

        tracing::info!(version = %migration.version, "applied migration");
        Ok(())
    }

    /// Reverts one applied version using its rollback script.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NotApplied` if the version has no tracking
    /// row, `MigrationError::RollbackMissing` if there is no rollback
    /// script, and `MigrationError::Rollback` if the script fails.
    pub fn rollback_migration(&self, version: &str) -> Result<(), MigrationError> {
        let ordinal = parse_version(version)?;
        let record = self
            .get_applied_migrations()?
            .into_iter()
            .find(|record| record.ordinal == ordinal)
            .ok_or_else(|| MigrationError::NotApplied(version.to_string()))?;
        let rollback = self
            .scan()?
            .rollback
            .remove(&ordinal)
            .ok_or_else(|| MigrationError::RollbackMissing {
                version: record.version.clone(),
            })?;
        self.revert(&record, &rollback)
    }

    fn revert(&self, record: &MigrationRecord, rollback: &Path) -> Result<(), MigrationError> {
        let script = read_script(rollback)?;
        if script.trim().is_empty() {
            tracing::warn!(version = %record.version, "rollback script is empty");
        }

        tracing::info!(version = %record.version, name = %record.name, "rolling back migration");

        let delete = format!("DELETE FROM {} WHERE version = ?1", self.table);
        self.executor
            .with_transaction(|tx| -> Result<(), DbError> {
                tx.execute_batch(&script)?;
                tx.execute(&delete, [&record.version])?;
                Ok(())
            })
            .map_err(|source| MigrationError::Rollback {
                version: record.version.clone(),
                source,
            })?;

        tracing::info!(version = %record.version, "rolled back migration");
        Ok(())
    }

    /// Applies pending migrations in version order, up to and including
    /// `target` when given.
    ///
    /// Already up to date is a successful no-op. Ordering is checked before
    /// anything runs, and the run halts at the first failure; migrations
    /// applied before it stay applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::OutOfOrder` if a pending version sorts
    /// below an applied one, and `MigrationError::Halted` naming the failed
    /// version and the versions completed before it.
    pub fn migrate_up(&self, target: Option<&str>) -> Result<UpReport, MigrationError> {
        let target = target.map(parse_version).transpose()?;
        let applied = self.get_applied_migrations()?;
        let available = self.get_available_migrations()?;

        for drift in find_drift(&available, &applied)? {
            tracing::warn!(
                version = %drift.version,
                "applied migration changed on disk; it will not be re-applied"
            );
        }

        let pending = pending_from(available, &applied);
        if let Some(latest) = applied.last() {
            if let Some(early) = pending.iter().find(|m| m.ordinal < latest.ordinal) {
                tracing::error!(
                    version = %early.version,
                    latest = %latest.version,
                    "pending migration is older than the latest applied one"
                );
                return Err(MigrationError::OutOfOrder {
                    version: early.version.clone(),
                    latest: latest.version.clone(),
                });
            }
        }

        let batch: Vec<MigrationFile> = pending
            .into_iter()
            .filter(|m| target.map_or(true, |t| m.ordinal <= t))
            .collect();
        if batch.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(UpReport::default());
        }

        let mut completed = Vec::with_capacity(batch.len());
        for migration in &batch {
            if let Err(e) = self.apply_migration(migration) {
                tracing::error!(
                    version = %migration.version,
                    succeeded = completed.len(),
                    error = %e,
                    "migration failed, halting"
                );
                return Err(MigrationError::Halted {
                    version: migration.version.clone(),
                    completed,
                    source: Box::new(e),
                });
            }
            completed.push(migration.version.clone());
        }

        tracing::info!(count = completed.len(), "applied migrations");
        Ok(UpReport { applied: completed })
    }

    /// Rolls back applied migrations from the highest version down to, but
    /// not including, `target`. Without a target every applied migration is
    /// rolled back.
    ///
    /// Rollback scripts for every affected version are located before any
    /// is run, so a missing one leaves the database untouched.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::RollbackMissing` before doing anything if a
    /// script is missing, and `MigrationError::Halted` if a rollback fails
    /// part-way; versions reverted before it stay reverted.
    pub fn migrate_down(&self, target: Option<&str>) -> Result<DownReport, MigrationError> {
        let target = target.map(parse_version).transpose()?;
        let applied = self.get_applied_migrations()?;
        let mut scripts = self.scan()?;

        let mut plan = Vec::new();
        for record in applied.iter().rev() {
            if target.is_some_and(|t| record.ordinal <= t) {
                continue;
            }
            let Some(rollback) = scripts.rollback.remove(&record.ordinal) else {
                tracing::error!(version = %record.version, "rollback script not found");
                return Err(MigrationError::RollbackMissing {
                    version: record.version.clone(),
                });
            };
            plan.push((record, rollback));
        }

        if plan.is_empty() {
            tracing::info!("no applied migrations to roll back");
            return Ok(DownReport::default());
        }

        let mut completed = Vec::with_capacity(plan.len());
        for (record, rollback) in plan {
            if let Err(e) = self.revert(record, &rollback) {
                tracing::error!(
                    version = %record.version,
                    succeeded = completed.len(),
                    error = %e,
                    "rollback failed, halting"
                );
                return Err(MigrationError::Halted {
                    version: record.version.clone(),
                    completed,
                    source: Box::new(e),
                });
            }
            completed.push(record.version.clone());
        }

        tracing::info!(count = completed.len(), "rolled back migrations");
        Ok(DownReport {
            reverted: completed,
        })
    }

    /// Reports applied and pending migrations along with checksum drift
    /// and applied versions whose script has disappeared.
    ///
    /// Findings are reported only; tracking rows are never modified.
    ///
    /// # Errors
    ///
    /// Propagates discovery, file-read, and tracking-table errors.
    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let applied = self.get_applied_migrations()?;
        let available = self.get_available_migrations()?;

        let drift = find_drift(&available, &applied)?;
        for entry in &drift {
            tracing::warn!(
                version = %entry.version,
                recorded = %entry.recorded,
                current = %entry.current,
                "checksum drift detected"
            );
        }

        let on_disk: HashSet<u64> = available.iter().map(|m| m.ordinal).collect();
        let missing_files = applied
            .iter()
            .filter(|record| !on_disk.contains(&record.ordinal))
            .map(|record| record.version.clone())
            .collect();

        Ok(MigrationStatus {
            pending: pending_from(available, &applied),
            applied,
            drift,
            missing_files,
        })
    }

    /// Fails on the first applied migration whose script has drifted.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ChecksumDrift`, or whatever
    /// [`MigrationManager::status`] returns.
    pub fn verify(&self) -> Result<(), MigrationError> {
        match self.status()?.drift.into_iter().next() {
            Some(drift) => Err(MigrationError::ChecksumDrift {
                version: drift.version,
                recorded: drift.recorded,
                current: drift.current,
            }),
            None => Ok(()),
        }
    }

    /// Creates the next sequential migration script for an operator to fill
    /// in, optionally with its rollback script.
    ///
    /// The version is one past the highest version seen on disk or in the
    /// tracking table, zero-padded to at least two digits. Existing files are
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidName` for a name with no usable
    /// characters, `MigrationError::AlreadyExists` if the target file
    /// exists, and `MigrationError::Io` on write failure.
    pub fn create_migration(
        &self,
        name: &str,
        with_rollback: bool,
    ) -> Result<CreatedMigration, MigrationError> {
        let slug = slugify(name)?;
        let scripts = self.scan()?;
        let applied = self.get_applied_migrations()?;

        let highest = scripts
            .forward
            .keys()
            .chain(scripts.rollback.keys())
            .chain(applied.iter().map(|record| &record.ordinal))
            .max()
            .copied();
        let next = highest.map_or(1, |h| h + 1);
        let width = scripts
            .forward
            .values()
            .map(|m| m.version.len())
            .chain(applied.iter().map(|record| record.version.len()))
            .max()
            .unwrap_or(2)
            .max(2);
        let version = format!("{next:0width$}");

        fs::create_dir_all(&self.dir).map_err(|source| MigrationError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let created = chrono::Utc::now().to_rfc3339();
        let path = self.dir.join(format!("{version}_{slug}.sql"));
        write_new_file(
            &path,
            &format!(
                "-- Migration: {slug}\n-- Version: {version}\n-- Created: {created}\n\n"
            ),
        )?;
        tracing::info!(path = %path.display(), "created migration file");

        let rollback = if with_rollback {
            let rollback_path = self.dir.join(format!("R{version}_{slug}.sql"));
            write_new_file(
                &rollback_path,
                &format!(
                    "-- Rollback: {slug}\n-- Version: {version}\n-- Created: {created}\n\n"
                ),
            )?;
            tracing::info!(path = %rollback_path.display(), "created rollback file");
            Some(rollback_path)
        } else {
            None
        };

        Ok(CreatedMigration {
            version,
            path,
            rollback,
        })
    }
}

fn pending_from(available: Vec<MigrationFile>, applied: &[MigrationRecord]) -> Vec<MigrationFile> {
    let applied: HashSet<u64> = applied.iter().map(|record| record.ordinal).collect();
    available
        .into_iter()
        .filter(|m| !applied.contains(&m.ordinal))
        .collect()
}

fn find_drift(
    available: &[MigrationFile],
    applied: &[MigrationRecord],
) -> Result<Vec<ChecksumDrift>, MigrationError> {
    let by_ordinal: HashMap<u64, &MigrationFile> =
        available.iter().map(|m| (m.ordinal, m)).collect();

    let mut drift = Vec::new();
    for record in applied {
        let Some(file) = by_ordinal.get(&record.ordinal) else {
            continue;
        };
        let current = checksum(&read_bytes(&file.path)?);
        if current != record.checksum {
            drift.push(ChecksumDrift {
                version: record.version.clone(),
                name: record.name.clone(),
                recorded: record.checksum.clone(),
                current,
            });
        }
    }
    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_forward_script_names() {
        let parsed = parse_script_name("03_add_user_roles.sql").expect("should parse");
        assert_eq!(
            parsed,
            ScriptName {
                kind: ScriptKind::Forward,
                ordinal: 3,
                version: "03".to_string(),
                label: "add user roles".to_string(),
            }
        );
    }

    #[test]
    fn parses_rollback_script_names() {
        let named = parse_script_name("R03_add_user_roles.sql").expect("named rollback");
        assert_eq!(named.kind, ScriptKind::Rollback);
        assert_eq!(named.ordinal, 3);

        let bare = parse_script_name("R12.sql").expect("bare rollback");
        assert_eq!(bare.kind, ScriptKind::Rollback);
        assert_eq!(bare.version, "12");
    }

    #[test]
    fn ignores_non_migration_files() {
        for name in [
            "README.md",
            "01.sql",
            "01_.sql",
            "v1_init.sql",
            "V20241201_init.sql",
            "01_init.sql.bak",
            "R_init.sql",
            "1a_init.sql",
        ] {
            assert!(parse_script_name(name).is_none(), "{name} should be ignored");
        }
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn slugify_normalizes_names() {
        assert_eq!(slugify("Add User Roles").expect("slug"), "add_user_roles");
        assert_eq!(slugify("  drop--legacy  ").expect("slug"), "drop_legacy");
        assert!(matches!(slugify("  ?? "), Err(MigrationError::InvalidName(_))));
    }

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(is_identifier("schema_migrations"));
        assert!(is_identifier("_m2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("x; DROP TABLE users"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn versions_parse_numerically() {
        assert_eq!(parse_version("007").expect("version"), 7);
        assert!(matches!(
            parse_version("V2024"),
            Err(MigrationError::InvalidVersion(_))
        ));
    }
}
