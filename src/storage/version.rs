use crate::error::OlapError;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

pub const VERSION_FILE: &str = "version.txt";

/// Millisecond timestamp naming one backing file of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableVersion(i64);

impl TableVersion {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self(millis)
    }

    /// The current time, bumped past `previous` when the clock has not moved
    /// (or moved backwards) since it was allocated. `None` once `previous` is
    /// the largest representable version.
    pub fn next_after(previous: Option<TableVersion>) -> Option<Self> {
        let now = Self::now();
        match previous {
            Some(prev) if prev >= now => prev.0.checked_add(1).map(Self),
            _ => Some(now),
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.db", self.0)
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TableVersion {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

/// Reads `<dir>/version.txt`. A missing marker is `Ok(None)`; an unreadable or
/// malformed one is an error.
pub fn read_marker(dir: &Path, table: &str) -> Result<Option<TableVersion>, OlapError> {
    let raw = match fs::read_to_string(dir.join(VERSION_FILE)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    raw.parse::<TableVersion>()
        .map(Some)
        .map_err(|e| OlapError::Storage {
            table: table.to_string(),
            message: format!("malformed {VERSION_FILE} {raw:?}: {e}"),
        })
}

/// Replaces the marker through a synced temp file and rename so readers see
/// either the old or the new version, never a torn write.
pub fn write_marker(dir: &Path, version: TableVersion) -> Result<(), OlapError> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(version.to_string().as_bytes())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(VERSION_FILE))
        .map_err(|e| OlapError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

fn fsync_dir(path: &Path) -> Result<(), OlapError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}
