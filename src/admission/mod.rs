//! Capacity pools in front of the access gate.
//!
//! Meta queries (catalog, information schema) are fast and get one dedicated
//! slot so they are never starved by analytical queries. OLAP queries share
//! the remaining budget and are admitted by priority. Long-running OLAP
//! queries additionally pass a cap of one so they cannot occupy every OLAP
//! slot at once.

pub mod priority;

use crate::error::OlapError;
use priority::{PriorityPermit, PrioritySemaphore};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const META_CAPACITY: usize = 1;
pub const LONG_RUNNING_CAPACITY: usize = 1;

#[derive(Debug)]
pub struct AdmissionControl {
    meta: Arc<Semaphore>,
    olap: PrioritySemaphore,
    long_running: Arc<Semaphore>,
}

/// Slots held for one acquisition. Fields drop in declaration order, which is
/// the reverse of acquisition order.
#[derive(Debug)]
pub enum AdmissionPermit {
    Meta(OwnedSemaphorePermit),
    Olap {
        olap: PriorityPermit,
        long_running: Option<OwnedSemaphorePermit>,
    },
}

impl AdmissionControl {
    pub fn new(olap_capacity: usize) -> Self {
        Self {
            meta: Arc::new(Semaphore::new(META_CAPACITY)),
            olap: PrioritySemaphore::new(olap_capacity.max(1)),
            long_running: Arc::new(Semaphore::new(LONG_RUNNING_CAPACITY)),
        }
    }

    pub async fn acquire_meta(&self) -> Result<AdmissionPermit, OlapError> {
        let permit = Arc::clone(&self.meta)
            .acquire_owned()
            .await
            .map_err(|_| OlapError::Closed)?;
        Ok(AdmissionPermit::Meta(permit))
    }

    /// Long-running cap first, then the priority-ordered OLAP pool. If the
    /// future is dropped while waiting for the OLAP slot, the long-running
    /// permit is released with it.
    pub async fn acquire_olap(
        &self,
        priority: i32,
        long_running: bool,
    ) -> Result<AdmissionPermit, OlapError> {
        let long_running = if long_running {
            Some(
                Arc::clone(&self.long_running)
                    .acquire_owned()
                    .await
                    .map_err(|_| OlapError::Closed)?,
            )
        } else {
            None
        };
        let olap = self.olap.acquire(priority).await?;
        Ok(AdmissionPermit::Olap { olap, long_running })
    }

    /// Stops admitting. Queued and future acquisitions fail with
    /// [`OlapError::Closed`].
    pub fn close(&self) {
        self.meta.close();
        self.long_running.close();
        self.olap.close();
    }

    pub fn olap_capacity(&self) -> usize {
        self.olap.capacity()
    }

    pub fn olap_available(&self) -> usize {
        self.olap.available()
    }

    pub fn meta_available(&self) -> usize {
        self.meta.available_permits()
    }

    pub fn long_running_available(&self) -> usize {
        self.long_running.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::AdmissionControl;
    use crate::error::OlapErrorCode;
    use std::time::Duration;

    #[tokio::test]
    async fn long_running_cap_is_independent_of_olap_capacity() {
        let admission = AdmissionControl::new(4);
        let first = admission.acquire_olap(0, true).await.expect("first");
        assert_eq!(admission.long_running_available(), 0);

        let second = tokio::time::timeout(
            Duration::from_millis(30),
            admission.acquire_olap(0, true),
        )
        .await;
        assert!(second.is_err(), "second long-running query must wait");
        assert_eq!(admission.olap_available(), 3);

        let short = admission.acquire_olap(0, false).await.expect("short");
        assert_eq!(admission.olap_available(), 2);

        drop(first);
        drop(short);
        assert_eq!(admission.olap_available(), 4);
        assert_eq!(admission.long_running_available(), 1);
    }

    #[tokio::test]
    async fn cancelled_olap_wait_returns_long_running_permit() {
        let admission = AdmissionControl::new(1);
        let blocker = admission.acquire_olap(0, false).await.expect("blocker");

        let waited = tokio::time::timeout(
            Duration::from_millis(30),
            admission.acquire_olap(0, true),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(admission.long_running_available(), 1);

        drop(blocker);
        assert_eq!(admission.olap_available(), 1);
    }

    #[tokio::test]
    async fn meta_pool_admits_one_at_a_time() {
        let admission = AdmissionControl::new(2);
        let held = admission.acquire_meta().await.expect("meta");
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), admission.acquire_meta()).await;
        assert!(blocked.is_err());
        drop(held);
        assert_eq!(admission.meta_available(), 1);
    }

    #[tokio::test]
    async fn closed_pools_reject_acquisition() {
        let admission = AdmissionControl::new(2);
        admission.close();
        let err = admission.acquire_meta().await.expect_err("closed");
        assert_eq!(err.code(), OlapErrorCode::Closed);
        let err = admission.acquire_olap(0, false).await.expect_err("closed");
        assert_eq!(err.code(), OlapErrorCode::Closed);
    }
}
