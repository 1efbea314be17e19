//! External per-table storage.
//!
//! Each table lives in its own database file under
//! `<root>/<table>/<version>.db`, with `<root>/<table>/version.txt` naming the
//! live version. The file is attached to the main handle as
//! `<table>_<version>` and the view `<table>` selects from it. Versions are
//! never modified after they are attached; replacing a table stages a new
//! version and publishes it.
//!
//! Recovery runs on every freshly opened handle and heals whatever a crash
//! left behind: tables without a marker and markers pointing at files that
//! are gone or unreadable are deleted. Versions no marker refers to are only
//! deleted by [`TableStorage::recover`] at startup; a reopen while the process
//! is running uses [`TableStorage::reattach`], which leaves staged versions of
//! in-flight replacements alone.

pub mod version;

use crate::engine::{Connection, quote_ident, quote_literal};
use crate::error::{EngineError, OlapError};
use crate::hygiene::{remove_dir_if_exists, remove_file_if_exists};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub use version::{TableVersion, VERSION_FILE, read_marker, write_marker};

/// Name of the table inside each backing file.
const INNER_TABLE: &str = "default";
/// Engine spill directories sit next to the database file and are never tables.
const SPILL_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct TableStorage {
    root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Database names attached, as `<table>_<version>`.
    pub attached: Vec<String>,
    /// Table directories deleted.
    pub removed: Vec<String>,
    /// Unreferenced version files deleted from surviving tables.
    pub stale_versions_removed: usize,
}

/// A version allocated by [`TableStorage::stage_version`] whose file the
/// caller fills before publishing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedVersion {
    table: String,
    version: TableVersion,
    path: PathBuf,
}

impl StagedVersion {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db_name(&self) -> String {
        db_name(&self.table, self.version)
    }
}

/// Attached database name for one table version.
pub fn db_name(table: &str, version: TableVersion) -> String {
    format!("{table}_{version}")
}

impl TableStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    pub fn db_path(&self, table: &str, version: TableVersion) -> PathBuf {
        self.table_dir(table).join(version.file_name())
    }

    pub fn current_version(&self, table: &str) -> Result<Option<TableVersion>, OlapError> {
        validate_table_name(table)?;
        read_marker(&self.table_dir(table), table)
    }

    /// Table directories under the root, sorted by name.
    pub fn tables(&self) -> Result<Vec<String>, OlapError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tables: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.ends_with(SPILL_SUFFIX))
            .collect();
        tables.sort();
        Ok(tables)
    }

    /// Re-attaches every table on the first handle of the process and deletes
    /// unreferenced versions. Only a failure to list the root is returned;
    /// per-table problems are logged and the table is deleted.
    pub fn recover(&self, conn: &mut dyn Connection) -> Result<RecoveryReport, OlapError> {
        self.recover_tables(conn, true)
    }

    /// Re-attaches every table on a reopened handle. Version files other than
    /// the live one may belong to a replacement that is not published yet and
    /// are kept.
    pub fn reattach(&self, conn: &mut dyn Connection) -> Result<RecoveryReport, OlapError> {
        self.recover_tables(conn, false)
    }

    fn recover_tables(
        &self,
        conn: &mut dyn Connection,
        prune_stale: bool,
    ) -> Result<RecoveryReport, OlapError> {
        let mut report = RecoveryReport::default();
        for table in self.tables()? {
            let dir = self.table_dir(&table);
            let version = match read_marker(&dir, &table) {
                Ok(Some(version)) => version,
                Ok(None) => {
                    debug!(table = %table, "table directory has no version marker, removing");
                    self.remove_table_dir(&table, &mut report);
                    continue;
                }
                Err(err) => {
                    error!(table = %table, error = %err, "error in fetching table version");
                    self.remove_table_dir(&table, &mut report);
                    continue;
                }
            };

            match self.attach(conn, &table, version) {
                Ok(db) => {
                    if prune_stale {
                        report.stale_versions_removed +=
                            self.remove_stale_versions(&table, version);
                    }
                    report.attached.push(db);
                }
                Err(err) => {
                    error!(
                        table = %table,
                        db = %self.db_path(&table, version).display(),
                        error = %err,
                        "attach failed, clearing table files"
                    );
                    let _ = conn.execute(&drop_view_sql(&table));
                    self.remove_table_dir(&table, &mut report);
                }
            }
        }
        if !report.attached.is_empty() || !report.removed.is_empty() {
            info!(
                attached = report.attached.len(),
                removed = report.removed.len(),
                "recovered external table storage"
            );
        }
        Ok(report)
    }

    /// Allocates a version newer than the live one and returns where its
    /// backing file goes. Nothing is attached until [`Self::publish`].
    pub fn stage_version(&self, table: &str) -> Result<StagedVersion, OlapError> {
        let current = self.current_version(table)?;
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir)?;
        let exhausted = || OlapError::Storage {
            table: table.to_string(),
            message: "no version number left after the current one".into(),
        };
        let mut version = TableVersion::next_after(current).ok_or_else(exhausted)?;
        while dir.join(version.file_name()).exists() {
            version = TableVersion::next_after(Some(version)).ok_or_else(exhausted)?;
        }
        Ok(StagedVersion {
            table: table.to_string(),
            path: dir.join(version.file_name()),
            version,
        })
    }

    /// Throws away a staged version that will not be published.
    pub fn discard(&self, staged: StagedVersion) -> Result<(), OlapError> {
        remove_file_if_exists(&staged.path)?;
        let dir = self.table_dir(&staged.table);
        if read_marker(&dir, &staged.table)?.is_none() {
            remove_dir_if_exists(&dir)?;
        }
        Ok(())
    }

    /// Makes a filled staged version live: record it in the marker, attach it,
    /// point the view at it, then detach and delete the previous version.
    ///
    /// If the attach fails the marker is put back, so the previous version
    /// stays live and the staged file can be retried or discarded. A crash
    /// between steps is repaired by the next recovery: the marker decides
    /// which version survives and the other file is removed.
    pub fn publish(&self, conn: &mut dyn Connection, staged: StagedVersion) -> Result<(), OlapError> {
        let table = staged.table.as_str();
        let previous = self.current_version(table)?;
        if !staged.path.is_file() {
            return Err(OlapError::Storage {
                table: table.to_string(),
                message: format!("staged file {} does not exist", staged.path.display()),
            });
        }

        let dir = self.table_dir(table);
        let db = staged.db_name();
        write_marker(&dir, staged.version)?;
        if let Err(err) = conn
            .execute(&attach_sql(&staged.path, &db))
            .and_then(|_| conn.execute(&view_sql(table, &db)))
        {
            let _ = conn.execute(&detach_sql(&db));
            match previous {
                Some(prev) => {
                    write_marker(&dir, prev)?;
                    if let Err(view_err) = conn.execute(&view_sql(table, &db_name(table, prev))) {
                        warn!(table = %table, error = %view_err, "failed to restore view of previous version");
                    }
                }
                None => {
                    remove_file_if_exists(&dir.join(VERSION_FILE))?;
                }
            }
            return Err(err.into());
        }

        if let Some(prev) = previous.filter(|prev| *prev != staged.version) {
            let prev_db = db_name(table, prev);
            if let Err(err) = conn.execute(&detach_sql(&prev_db)) {
                warn!(table = %table, db = %prev_db, error = %err, "detach of previous version failed");
            }
            remove_file_if_exists(&self.db_path(table, prev))?;
        }
        info!(table = %table, version = %staged.version, "published table version");
        Ok(())
    }

    /// Drops the view, detaches the live version and deletes the table
    /// directory. Returns whether the table existed.
    pub fn drop_table(&self, conn: &mut dyn Connection, table: &str) -> Result<bool, OlapError> {
        validate_table_name(table)?;
        let version = self.current_version(table).unwrap_or_else(|err| {
            warn!(table = %table, error = %err, "dropping table with unreadable version marker");
            None
        });
        conn.execute(&drop_view_sql(table))?;
        if let Some(version) = version {
            conn.execute(&detach_sql(&db_name(table, version)))?;
        }
        let existed = remove_dir_if_exists(&self.table_dir(table))?;
        if existed {
            info!(table = %table, "dropped table storage");
        }
        Ok(existed)
    }

    fn attach(
        &self,
        conn: &mut dyn Connection,
        table: &str,
        version: TableVersion,
    ) -> Result<String, EngineError> {
        let path = self.db_path(table, version);
        if !path.is_file() {
            return Err(EngineError::new(format!(
                "IO Error: Cannot open file \"{}\": No such file or directory",
                path.display()
            )));
        }
        let db = db_name(table, version);
        conn.execute(&attach_sql(&path, &db))?;
        conn.execute(&view_sql(table, &db))?;
        Ok(db)
    }

    fn remove_table_dir(&self, table: &str, report: &mut RecoveryReport) {
        match remove_dir_if_exists(&self.table_dir(table)) {
            Ok(_) => report.removed.push(table.to_string()),
            Err(err) => warn!(table = %table, error = %err, "failed to remove table directory"),
        }
    }

    fn remove_stale_versions(&self, table: &str, live: TableVersion) -> usize {
        let Ok(entries) = fs::read_dir(self.table_dir(table)) else {
            return 0;
        };
        let live_name = live.file_name();
        let mut removed = 0;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == live_name || name == VERSION_FILE {
                continue;
            }
            let is_version_file = name
                .strip_suffix(".db")
                .is_some_and(|stem| stem.parse::<TableVersion>().is_ok());
            if !is_version_file {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(table = %table, file = %name, error = %err, "failed to remove stale version"),
            }
        }
        removed
    }
}

fn validate_table_name(table: &str) -> Result<(), OlapError> {
    let invalid = table.is_empty()
        || table == "."
        || table == ".."
        || table.contains(['/', '\\'])
        || table.ends_with(SPILL_SUFFIX);
    if invalid {
        return Err(OlapError::Storage {
            table: table.to_string(),
            message: "invalid table name".into(),
        });
    }
    Ok(())
}

fn attach_sql(path: &Path, db: &str) -> String {
    format!(
        "ATTACH {} AS {}",
        quote_literal(&path.display().to_string()),
        quote_ident(db)
    )
}

fn detach_sql(db: &str) -> String {
    format!("DETACH DATABASE IF EXISTS {}", quote_ident(db))
}

fn view_sql(table: &str, db: &str) -> String {
    format!(
        "CREATE OR REPLACE VIEW {} AS SELECT * FROM {}.{}",
        quote_ident(table),
        quote_ident(db),
        quote_ident(INNER_TABLE)
    )
}

fn drop_view_sql(table: &str) -> String {
    format!("DROP VIEW IF EXISTS {}", quote_ident(table))
}
