//! Seam to the embedded engine.
//!
//! The manager never talks to a concrete engine. An embedder implements
//! [`Engine`] over its engine binding; [`fake::FakeEngine`] is an in-process
//! implementation with fault injection used by the tests.

pub mod boot;
pub mod fake;

use crate::error::EngineError;
use std::sync::Arc;

/// Runs on every new physical connection before it is handed out.
pub type BootHook = Arc<dyn Fn(&mut dyn Connection) -> Result<(), EngineError> + Send + Sync>;

/// Connection factory entry point of the engine.
pub trait Engine: Send + Sync + 'static {
    /// Opens a new handle for `dsn`. `boot` must run on each physical
    /// connection the handle creates.
    fn open(
        &self,
        dsn: &str,
        max_connections: usize,
        boot: BootHook,
    ) -> Result<Box<dyn Handle>, EngineError>;
}

pub trait Handle: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

pub trait Connection: Send {
    /// Executes a statement and returns the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64, EngineError>;

    fn query(&mut self, sql: &str) -> Result<Rows, EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Quotes a string literal for engine SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quotes an identifier for engine SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
