//! Classification of engine errors by message text.
//!
//! The engine exposes no structured error codes, so everything here matches on
//! message prefixes and substrings. This is a best-effort contract with the
//! engine and must be revisited whenever the engine version changes; keep all
//! matching in this module so the state machines never inspect messages.

use crate::error::{EngineError, OlapError};

const FATAL_PREFIXES: [&str; 2] = ["INTERNAL Error:", "FATAL Error"];
const INCOMPATIBLE_VERSION: &str = "Trying to read a database file with version number";
const LOCKED_BY_OTHER_PROCESS: &str = "Could not set lock on file";

/// Whether the engine reported corruption of its process-wide state. The only
/// recovery is closing and reopening the handle.
pub fn is_fatal(err: &EngineError) -> bool {
    FATAL_PREFIXES
        .iter()
        .any(|prefix| err.message.starts_with(prefix))
}

pub fn is_incompatible_format(err: &EngineError) -> bool {
    err.message.contains(INCOMPATIBLE_VERSION)
}

pub fn is_locked_by_other_process(err: &EngineError) -> bool {
    err.message.contains(LOCKED_BY_OTHER_PROCESS)
}

/// Maps an error returned while opening a handle for `dsn`.
pub fn open_error(dsn: &str, err: EngineError) -> OlapError {
    if is_incompatible_format(&err) {
        return OlapError::IncompatibleFormat {
            path: dsn.to_string(),
        };
    }
    if is_locked_by_other_process(&err) {
        return OlapError::LockedByAnotherProcess { source: err };
    }
    OlapError::Engine(err)
}
