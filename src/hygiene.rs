//! Filesystem housekeeping around the main database file.

use crate::config::OlapConfig;
use crate::error::OlapError;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HygieneReport {
    pub removed_tmp_dir: bool,
    pub removed_wal_bytes: Option<u64>,
}

/// Runs before every open of a file-backed database: the spill directory is
/// always stale, and a write-ahead log at or above the configured threshold is
/// dropped rather than replayed.
pub fn prepare_db_files(config: &OlapConfig) -> Result<HygieneReport, OlapError> {
    let mut report = HygieneReport::default();
    if let Some(tmp) = config.tmp_dir_path() {
        report.removed_tmp_dir = remove_dir_if_exists(&tmp)?;
    }
    if let Some(wal) = config.wal_path() {
        let size = match fs::metadata(&wal) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(size) = size.filter(|s| *s >= config.wal_size_threshold_bytes) {
            warn!(
                path = %wal.display(),
                size,
                threshold = config.wal_size_threshold_bytes,
                "removing oversized write-ahead log before open"
            );
            remove_file_if_exists(&wal)?;
            report.removed_wal_bytes = Some(size);
        }
    }
    Ok(report)
}

/// Deletes the database file with its WAL and spill directory. Used to
/// recover from an incompatible on-disk format.
pub fn reset_db_files(config: &OlapConfig) -> Result<(), OlapError> {
    let Some(db) = config.db_file_path() else {
        return Ok(());
    };
    info!(path = %db.display(), "resetting database files");
    remove_file_if_exists(&db)?;
    if let Some(wal) = config.wal_path() {
        remove_file_if_exists(&wal)?;
    }
    if let Some(tmp) = config.tmp_dir_path() {
        remove_dir_if_exists(&tmp)?;
    }
    Ok(())
}

/// Removes everything the manager stores: an explicit external storage root
/// as a whole, otherwise the database files together with the default table
/// storage root.
pub fn drop_files(config: &OlapConfig) -> Result<(), OlapError> {
    if config.external_table_storage {
        if let Some(root) = &config.external_storage_path {
            info!(path = %root.display(), "removing external table storage");
            remove_dir_if_exists(root)?;
            return Ok(());
        }
        if let Some(root) = config.storage_root() {
            remove_dir_if_exists(&root)?;
        }
    }
    reset_db_files(config)
}

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
