//! In-process engine with fault injection.
//!
//! Understands the handful of statements the manager itself issues (ATTACH,
//! DETACH, view maintenance, `SELECT * FROM <view>`) and accepts everything
//! else. Database files are plain files starting with [`FAKE_DB_MAGIC`];
//! anything else is reported as an incompatible storage version, the same way
//! the real engine reports files written by an older release.

use crate::engine::{BootHook, Connection, Engine, Handle, Rows, Value};
use crate::error::EngineError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const FAKE_DB_MAGIC: &[u8] = b"FAKEDB v2\n";

const INCOMPATIBLE_VERSION: &str = "IO Error: Trying to read a database file with version number 1, but we can only read version 2";

#[derive(Debug, Clone)]
struct StatementFailure {
    needle: String,
    message: String,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct FakeState {
    opens: usize,
    closes: usize,
    boots: usize,
    connections_live: usize,
    max_connections_live: usize,
    open_failures: VecDeque<String>,
    statement_failures: Vec<StatementFailure>,
    executed: Vec<String>,
    attached: BTreeMap<String, PathBuf>,
    views: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an empty database file the engine can attach.
    pub fn write_database_file(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, FAKE_DB_MAGIC)
    }

    /// The next `open` fails with `message`. Queued failures are consumed in order.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.state.lock().open_failures.push_back(message.into());
    }

    /// Every statement containing `needle` fails with `message` until cleared.
    pub fn fail_statements(&self, needle: impl Into<String>, message: impl Into<String>) {
        self.state.lock().statement_failures.push(StatementFailure {
            needle: needle.into(),
            message: message.into(),
            remaining: None,
        });
    }

    /// The next statement containing `needle` fails with `message`.
    pub fn fail_statement_once(&self, needle: impl Into<String>, message: impl Into<String>) {
        self.state.lock().statement_failures.push(StatementFailure {
            needle: needle.into(),
            message: message.into(),
            remaining: Some(1),
        });
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.open_failures.clear();
        state.statement_failures.clear();
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Number of physical connections that ran the boot hook.
    pub fn boot_count(&self) -> usize {
        self.state.lock().boots
    }

    pub fn connections_live(&self) -> usize {
        self.state.lock().connections_live
    }

    pub fn max_connections_live(&self) -> usize {
        self.state.lock().max_connections_live
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.state.lock().attached.keys().cloned().collect()
    }

    pub fn views(&self) -> BTreeMap<String, String> {
        self.state.lock().views.clone()
    }
}

impl Engine for FakeEngine {
    fn open(
        &self,
        dsn: &str,
        _max_connections: usize,
        boot: BootHook,
    ) -> Result<Box<dyn Handle>, EngineError> {
        let mut state = self.state.lock();
        if let Some(message) = state.open_failures.pop_front() {
            return Err(EngineError::new(message));
        }
        if let Some(path) = file_path(dsn) {
            match fs::read(&path) {
                Ok(bytes) if !bytes.is_empty() && !bytes.starts_with(FAKE_DB_MAGIC) => {
                    return Err(EngineError::new(INCOMPATIBLE_VERSION));
                }
                Ok(bytes) if !bytes.is_empty() => {}
                _ => FakeEngine::write_database_file(&path)
                    .map_err(|e| EngineError::new(format!("IO Error: {e}")))?,
            }
        }
        state.opens += 1;
        Ok(Box::new(FakeHandle {
            state: Arc::clone(&self.state),
            boot,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

fn file_path(dsn: &str) -> Option<PathBuf> {
    let path = dsn.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
    boot: BootHook,
    closed: Arc<AtomicBool>,
}

impl Handle for FakeHandle {
    fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::new("Connection Error: database has been closed"));
        }
        {
            let mut state = self.state.lock();
            state.connections_live += 1;
            state.max_connections_live = state.max_connections_live.max(state.connections_live);
        }
        let mut conn = FakeConnection {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
        };
        (self.boot)(&mut conn)?;
        self.state.lock().boots += 1;
        Ok(Box::new(conn))
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.closes += 1;
        // attachments live in the instance, views live in the main database
        state.attached.clear();
        Ok(())
    }
}

struct FakeConnection {
    state: Arc<Mutex<FakeState>>,
    closed: Arc<AtomicBool>,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.connections_live = state.connections_live.saturating_sub(1);
    }
}

impl FakeConnection {
    fn admit(&self, state: &mut FakeState, sql: &str) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::new("Connection Error: database has been closed"));
        }
        state.executed.push(sql.to_string());
        let mut failure = None;
        for f in state.statement_failures.iter_mut() {
            if sql.contains(&f.needle) {
                if let Some(remaining) = f.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                }
                failure = Some(f.message.clone());
                break;
            }
        }
        state
            .statement_failures
            .retain(|f| f.remaining.is_none_or(|r| r > 0));
        match failure {
            Some(message) => Err(EngineError::new(message)),
            None => Ok(()),
        }
    }
}

impl Connection for FakeConnection {
    fn execute(&mut self, sql: &str) -> Result<u64, EngineError> {
        let mut state = self.state.lock();
        self.admit(&mut state, sql)?;
        let sql = sql.trim();

        if let Some(rest) = sql.strip_prefix("ATTACH ") {
            let (path, rest) = parse_quoted(rest.trim_start(), '\'').ok_or_else(|| syntax(sql))?;
            let rest = rest.trim_start().strip_prefix("AS ").ok_or_else(|| syntax(sql))?;
            let (name, _) = parse_ident(rest.trim_start()).ok_or_else(|| syntax(sql))?;
            if state.attached.contains_key(&name) {
                return Err(EngineError::new(format!(
                    "Binder Error: Failed to attach database: database with name \"{name}\" already exists"
                )));
            }
            match fs::read(&path) {
                Ok(bytes) if bytes.starts_with(FAKE_DB_MAGIC) => {}
                Ok(_) => return Err(EngineError::new(INCOMPATIBLE_VERSION)),
                Err(e) => {
                    return Err(EngineError::new(format!(
                        "IO Error: Cannot open file \"{path}\": {e}"
                    )));
                }
            }
            state.attached.insert(name, PathBuf::from(path));
            return Ok(0);
        }

        if let Some(rest) = sql
            .strip_prefix("DETACH DATABASE IF EXISTS ")
            .or_else(|| sql.strip_prefix("DETACH "))
        {
            let (name, _) = parse_ident(rest.trim_start()).ok_or_else(|| syntax(sql))?;
            state.attached.remove(&name);
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix("DROP VIEW IF EXISTS ") {
            let (name, _) = parse_ident(rest.trim_start()).ok_or_else(|| syntax(sql))?;
            state.views.remove(&name);
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix("CREATE OR REPLACE VIEW ") {
            let (view, rest) = parse_ident(rest.trim_start()).ok_or_else(|| syntax(sql))?;
            let rest = rest
                .trim_start()
                .strip_prefix("AS SELECT * FROM ")
                .ok_or_else(|| syntax(sql))?;
            let (database, _) = parse_ident(rest.trim_start()).ok_or_else(|| syntax(sql))?;
            if !state.attached.contains_key(&database) {
                return Err(EngineError::new(format!(
                    "Catalog Error: Catalog \"{database}\" does not exist!"
                )));
            }
            state.views.insert(view, database);
            return Ok(0);
        }

        Ok(0)
    }

    fn query(&mut self, sql: &str) -> Result<Rows, EngineError> {
        let mut state = self.state.lock();
        self.admit(&mut state, sql)?;
        let sql = sql.trim().trim_end_matches(';');

        if sql.eq_ignore_ascii_case("SELECT 1") {
            return Ok(Rows {
                columns: vec!["1".into()],
                rows: vec![vec![Value::Integer(1)]],
            });
        }

        if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
            let (name, _) = parse_ident(rest.trim_start()).ok_or_else(|| syntax(sql))?;
            let database = state
                .views
                .get(&name)
                .filter(|db| state.attached.contains_key(*db))
                .cloned()
                .ok_or_else(|| {
                    EngineError::new(format!(
                        "Catalog Error: Table with name {name} does not exist!"
                    ))
                })?;
            return Ok(Rows {
                columns: vec!["database".into()],
                rows: vec![vec![Value::Text(database)]],
            });
        }

        Ok(Rows::default())
    }
}

fn syntax(sql: &str) -> EngineError {
    EngineError::new(format!("Parser Error: syntax error in \"{sql}\""))
}

fn parse_ident(input: &str) -> Option<(String, &str)> {
    if input.starts_with('"') {
        return parse_quoted(input, '"');
    }
    let end = input
        .find(|c: char| c.is_whitespace() || c == '.' || c == ';')
        .unwrap_or(input.len());
    if end == 0 {
        return None;
    }
    Some((input[..end].to_string(), &input[end..]))
}

fn parse_quoted(input: &str, quote: char) -> Option<(String, &str)> {
    let body = input.strip_prefix(quote)?;
    let mut out = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            if matches!(chars.peek(), Some(&(_, next)) if next == quote) {
                out.push(quote);
                chars.next();
                continue;
            }
            return Some((out, &body[i + c.len_utf8()..]));
        }
        out.push(c);
    }
    None
}
