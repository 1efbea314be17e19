//! Live-connection tracking and the drain-then-reopen protocol.
//!
//! The engine keeps process-wide state, so after a fatal error the handle can
//! only be replaced once no connection is outstanding. A fatal error moves the
//! gate to `ReopenRequested`; new acquisitions wait, existing ones drain, and
//! the release that brings the live count to zero performs the reopen. If the
//! reopen fails the gate is `Failed` for the rest of the process lifetime.

use crate::classify;
use crate::engine::{Connection, Handle};
use crate::error::{EngineError, OlapError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

/// Builds a fresh handle, including the boot sequence and table re-attachment.
pub type Opener = Box<dyn Fn() -> Result<Box<dyn Handle>, OlapError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Open,
    /// Draining while `live > 0`.
    ReopenRequested,
    Reopening,
    Failed(String),
    Closed,
}

struct GateState {
    handle: Option<Arc<dyn Handle>>,
    live: usize,
    phase: Phase,
    reopens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub connections_in_use: usize,
    pub reopen_pending: bool,
    pub reopens: u64,
    pub failed: bool,
}

pub struct AccessGate {
    state: Mutex<GateState>,
    wake: Notify,
    opener: Opener,
}

impl std::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate")
            .field("stats", &self.stats())
            .finish()
    }
}

impl AccessGate {
    pub fn new(handle: Box<dyn Handle>, opener: Opener) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                handle: Some(Arc::from(handle)),
                live: 0,
                phase: Phase::Open,
                reopens: 0,
            }),
            wake: Notify::new(),
            opener,
        })
    }

    /// Registers a live connection, waiting while a reopen is pending.
    ///
    /// Fails immediately once a reopen has failed. Dropping the future while
    /// it waits leaves the count untouched.
    pub async fn enter(self: &Arc<Self>) -> Result<GateGuard, OlapError> {
        loop {
            // created before the state check so a wake between check and await is not lost
            let notified = self.wake.notified();
            {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                match &st.phase {
                    Phase::Open => {
                        st.live += 1;
                        return Ok(GateGuard {
                            gate: Arc::clone(self),
                            released: false,
                        });
                    }
                    Phase::Failed(message) => {
                        return Err(OlapError::ReopenFailed {
                            message: message.clone(),
                        });
                    }
                    Phase::Closed => return Err(OlapError::Closed),
                    Phase::ReopenRequested | Phase::Reopening => {}
                }
            }
            notified.await;
        }
    }

    /// Marks the handle for reopening. The reopen runs in the release that
    /// drains the live count, or right away when nothing is live.
    pub fn request_reopen(&self) -> Result<(), OlapError> {
        let mut st = self.state.lock();
        if st.phase != Phase::Open {
            return Ok(());
        }
        st.phase = Phase::ReopenRequested;
        if st.live == 0 {
            return self.run_reopen(st);
        }
        Ok(())
    }

    /// Schedules a reopen when `err` carries a fatal signature and hands the
    /// error back unchanged. Must be called while the caller's connection is
    /// still live, otherwise the reopen could race a fresh acquisition.
    pub fn check_err(&self, err: EngineError) -> EngineError {
        if classify::is_fatal(&err) {
            error!(error = %err, "encountered internal engine error - scheduling reopen");
            if let Err(reopen_err) = self.request_reopen() {
                error!(error = %reopen_err, "immediate reopen failed");
            }
        }
        err
    }

    /// Replaces the handle while the caller holds the only live connection
    /// slot. Used by exclusive acquisitions on file-backed databases.
    pub(crate) fn reopen_exclusive(&self) -> Result<(), OlapError> {
        let st = self.state.lock();
        match &st.phase {
            Phase::Failed(message) => Err(OlapError::ReopenFailed {
                message: message.clone(),
            }),
            Phase::Closed => Err(OlapError::Closed),
            _ => self.run_reopen(st),
        }
    }

    pub(crate) fn connect(&self) -> Result<Box<dyn Connection>, OlapError> {
        let handle = self.state.lock().handle.clone().ok_or(OlapError::Closed)?;
        handle.connect().map_err(|e| OlapError::Engine(self.check_err(e)))
    }

    pub fn stats(&self) -> GateStats {
        let st = self.state.lock();
        GateStats {
            connections_in_use: st.live,
            reopen_pending: matches!(st.phase, Phase::ReopenRequested | Phase::Reopening),
            reopens: st.reopens,
            failed: matches!(st.phase, Phase::Failed(_)),
        }
    }

    /// Closes the handle. Waiters and later acquisitions fail with
    /// [`OlapError::Closed`]; connections still live are not waited for.
    pub fn close(&self) -> Result<(), OlapError> {
        let handle = {
            let mut st = self.state.lock();
            st.phase = Phase::Closed;
            st.handle.take()
        };
        self.wake.notify_waiters();
        if let Some(handle) = handle {
            handle.close()?;
        }
        Ok(())
    }

    fn release(&self) -> Result<(), OlapError> {
        let mut st = self.state.lock();
        debug_assert!(st.live > 0, "release without a live connection");
        st.live = st.live.saturating_sub(1);
        if st.live == 0 && st.phase == Phase::ReopenRequested {
            return self.run_reopen(st);
        }
        Ok(())
    }

    /// Closes the old handle and opens a new one without holding the state
    /// lock. `Reopening` keeps new acquisitions out meanwhile.
    fn run_reopen(&self, mut st: MutexGuard<'_, GateState>) -> Result<(), OlapError> {
        st.phase = Phase::Reopening;
        let old = st.handle.take();
        drop(st);

        let result = match old {
            Some(handle) => handle.close().map_err(OlapError::from),
            None => Ok(()),
        }
        .and_then(|()| (self.opener)());

        let mut st = self.state.lock();
        let outcome = match result {
            Ok(handle) if st.phase == Phase::Closed => {
                drop(st);
                let _ = handle.close();
                return Err(OlapError::Closed);
            }
            Ok(handle) => {
                st.handle = Some(Arc::from(handle));
                st.phase = Phase::Open;
                st.reopens += 1;
                info!(reopens = st.reopens, "reopened database successfully");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "reopen of database failed - the handle is now permanently locked");
                if st.phase != Phase::Closed {
                    st.phase = Phase::Failed(err.to_string());
                }
                Err(err)
            }
        };
        drop(st);
        self.wake.notify_waiters();
        outcome
    }
}

/// One live connection slot. Releasing the last slot while a reopen is pending
/// performs the reopen synchronously.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<AccessGate>,
    released: bool,
}

impl GateGuard {
    pub fn gate(&self) -> &Arc<AccessGate> {
        &self.gate
    }

    /// Releases the slot and reports the result of a reopen it triggered.
    pub fn release(mut self) -> Result<(), OlapError> {
        self.released = true;
        self.gate.release()
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.gate.release() {
                error!(error = %err, "releasing connection failed");
            }
        }
    }
}
