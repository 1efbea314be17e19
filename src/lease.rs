use crate::admission::AdmissionPermit;
use crate::engine::{Connection, Rows};
use crate::error::{EngineError, OlapError};
use crate::gate::{AccessGate, GateGuard};
use crate::txlock::{Consistency, TxGuard};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

/// Emptied by the owning lease on release, so scoped leases that outlive their
/// scope cannot reach a connection whose slots are gone.
type SharedConnection = Arc<Mutex<Option<Box<dyn Connection>>>>;

tokio::task_local! {
    static SCOPED: ScopedConnection;
}

/// A connection handed out by [`crate::OlapManager`], together with every slot
/// taken to obtain it.
///
/// Errors from `execute`/`query` are classified on the way out, so a fatal
/// engine error schedules a reopen while this lease still counts as live.
/// Dropping the lease releases everything; [`Lease::release`] does the same
/// and reports a reopen failure it triggered.
pub struct Lease {
    conn: Option<SharedConnection>,
    gate: Arc<AccessGate>,
    consistency: Consistency,
    slots: Option<Slots>,
}

/// Released gate first, then admission, then the transaction lock: the
/// reverse of acquisition order.
struct Slots {
    gate: GateGuard,
    admission: AdmissionPermit,
    tx: TxGuard,
}

impl Lease {
    pub(crate) fn new(
        conn: Box<dyn Connection>,
        gate: GateGuard,
        admission: AdmissionPermit,
        tx: TxGuard,
    ) -> Self {
        Self {
            conn: Some(Arc::new(Mutex::new(Some(conn)))),
            gate: Arc::clone(gate.gate()),
            consistency: tx.consistency(),
            slots: Some(Slots {
                gate,
                admission,
                tx,
            }),
        }
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// Whether this lease borrows the connection of an enclosing
    /// `with_connection` scope. Such leases hold no slots.
    pub fn is_scoped(&self) -> bool {
        self.slots.is_none()
    }

    pub fn release(mut self) -> Result<(), OlapError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), OlapError> {
        // the connection must be gone before the gate may close the handle
        let shared = self.conn.take();
        if self.slots.is_some() {
            if let Some(shared) = shared {
                drop(shared.lock().take());
            }
        }
        let Some(Slots {
            gate,
            admission,
            tx,
        }) = self.slots.take()
        else {
            return Ok(());
        };
        let result = gate.release();
        drop(admission);
        drop(tx);
        result
    }

    fn with_conn<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let released = || EngineError::new("Connection Error: lease already released");
        let Some(shared) = self.conn.as_ref() else {
            return Err(released());
        };
        let mut guard = shared.lock();
        let Some(conn) = guard.as_mut() else {
            return Err(released());
        };
        f(conn.as_mut()).map_err(|e| self.gate.check_err(e))
    }

    pub(crate) fn scope(&self, manager_id: u64) -> Option<ScopedConnection> {
        Some(ScopedConnection {
            manager_id,
            conn: Arc::clone(self.conn.as_ref()?),
            gate: Arc::clone(&self.gate),
            consistency: self.consistency,
        })
    }
}

impl Connection for Lease {
    fn execute(&mut self, sql: &str) -> Result<u64, EngineError> {
        self.with_conn(|conn| conn.execute(sql))
    }

    fn query(&mut self, sql: &str) -> Result<Rows, EngineError> {
        self.with_conn(|conn| conn.query(sql))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            error!(error = %err, "release of connection failed");
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("consistency", &self.consistency)
            .field("scoped", &self.is_scoped())
            .field("released", &self.conn.is_none())
            .finish()
    }
}

/// The connection of a running `with_connection` call, visible to
/// acquisitions made by the same task.
#[derive(Clone)]
pub(crate) struct ScopedConnection {
    manager_id: u64,
    conn: SharedConnection,
    gate: Arc<AccessGate>,
    consistency: Consistency,
}

impl ScopedConnection {
    pub(crate) fn lease(&self) -> Lease {
        Lease {
            conn: Some(Arc::clone(&self.conn)),
            gate: Arc::clone(&self.gate),
            consistency: self.consistency,
            slots: None,
        }
    }
}

/// A slot-free lease on the enclosing scope's connection, when the current
/// task runs inside `with_connection` of the manager `manager_id`.
pub(crate) fn scoped_lease(manager_id: u64) -> Option<Lease> {
    SCOPED
        .try_with(|scoped| (scoped.manager_id == manager_id).then(|| scoped.lease()))
        .ok()
        .flatten()
}

/// Runs `fut` with `scoped` as the current task's scoped connection. Tasks
/// spawned from `fut` do not inherit it.
pub(crate) async fn run_scoped<F: Future>(scoped: ScopedConnection, fut: F) -> F::Output {
    SCOPED.scope(scoped, fut).await
}
