use crate::error::{EngineError, OlapError};
use crate::{Lease, OlapManager, OlapStats};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Drives `f` to completion from synchronous code. Inside a multi-threaded
/// runtime the current worker is handed over with `block_in_place`.
pub fn block_on_olap<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

/// Blocking facade over [`OlapManager`] for callers without an async context.
pub struct OlapManagerSync {
    inner: Arc<OlapManager>,
    rt: Handle,
}

impl OlapManagerSync {
    pub fn new(inner: Arc<OlapManager>, rt: Handle) -> Self {
        Self { inner, rt }
    }

    pub fn manager(&self) -> &Arc<OlapManager> {
        &self.inner
    }

    pub fn acquire_meta(&self) -> Result<Lease, OlapError> {
        block_on_olap(&self.rt, self.inner.acquire_meta())
    }

    pub fn acquire_olap(
        &self,
        priority: i32,
        long_running: bool,
        transactional: bool,
    ) -> Result<Lease, OlapError> {
        block_on_olap(
            &self.rt,
            self.inner.acquire_olap(priority, long_running, transactional),
        )
    }

    pub fn check_err(&self, err: EngineError) -> EngineError {
        self.inner.check_err(err)
    }

    pub fn stats(&self) -> OlapStats {
        self.inner.stats()
    }

    pub fn close(&self) -> Result<(), OlapError> {
        self.inner.close()
    }
}
