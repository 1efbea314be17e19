use thiserror::Error;

/// Error reported by the embedded engine. Only the message text is exposed by
/// the engine, so classification works on it (see [`crate::classify`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OlapErrorCode {
    Engine,
    ReopenFailed,
    IncompatibleFormat,
    LockedByAnotherProcess,
    InvalidConfig,
    Io,
    Timeout,
    Closed,
    Storage,
}

impl OlapErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OlapErrorCode::Engine => "engine",
            OlapErrorCode::ReopenFailed => "reopen_failed",
            OlapErrorCode::IncompatibleFormat => "incompatible_format",
            OlapErrorCode::LockedByAnotherProcess => "locked_by_another_process",
            OlapErrorCode::InvalidConfig => "invalid_config",
            OlapErrorCode::Io => "io",
            OlapErrorCode::Timeout => "timeout",
            OlapErrorCode::Closed => "closed",
            OlapErrorCode::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum OlapError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("reopen of the database failed, restart required: {message}")]
    ReopenFailed { message: String },
    #[error(
        "database file {path:?} was created with an older, incompatible version (please remove it and try again)"
    )]
    IncompatibleFormat { path: String },
    #[error("failed to open database (is another instance already running?): {source}")]
    LockedByAnotherProcess { source: EngineError },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a connection")]
    Timeout,
    #[error("connection manager is closed")]
    Closed,
    #[error("table storage error for '{table}': {message}")]
    Storage { table: String, message: String },
}

impl OlapError {
    pub fn code(&self) -> OlapErrorCode {
        match self {
            OlapError::Engine(_) => OlapErrorCode::Engine,
            OlapError::ReopenFailed { .. } => OlapErrorCode::ReopenFailed,
            OlapError::IncompatibleFormat { .. } => OlapErrorCode::IncompatibleFormat,
            OlapError::LockedByAnotherProcess { .. } => OlapErrorCode::LockedByAnotherProcess,
            OlapError::InvalidConfig { .. } => OlapErrorCode::InvalidConfig,
            OlapError::Io(_) => OlapErrorCode::Io,
            OlapError::Timeout => OlapErrorCode::Timeout,
            OlapError::Closed => OlapErrorCode::Closed,
            OlapError::Storage { .. } => OlapErrorCode::Storage,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// The engine message when this error is a passthrough engine error.
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            OlapError::Engine(e) => Some(&e.message),
            _ => None,
        }
    }
}
