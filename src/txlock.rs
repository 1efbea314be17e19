use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Consistency granted to a lease.
///
/// `Exclusive` is not a database transaction. It only guarantees that no other
/// lease is live while it is held; a crash inside the window can leave partial
/// writes behind, which callers must be able to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Shared,
    Exclusive,
}

/// Reader/writer exclusion between ordinary and transactional acquisitions.
///
/// The lock is fair: a queued writer blocks readers that arrive after it, so a
/// task must never take a second read guard while it already holds one (use
/// scoped connections for that).
#[derive(Debug, Default)]
pub struct TransactionLock {
    lock: Arc<RwLock<()>>,
}

#[derive(Debug)]
pub enum TxGuard {
    Shared { _guard: OwnedRwLockReadGuard<()> },
    Exclusive { _guard: OwnedRwLockWriteGuard<()> },
}

impl TxGuard {
    pub fn consistency(&self) -> Consistency {
        match self {
            TxGuard::Shared { .. } => Consistency::Shared,
            TxGuard::Exclusive { .. } => Consistency::Exclusive,
        }
    }
}

impl TransactionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, consistency: Consistency) -> TxGuard {
        let lock = Arc::clone(&self.lock);
        match consistency {
            Consistency::Shared => TxGuard::Shared {
                _guard: lock.read_owned().await,
            },
            Consistency::Exclusive => TxGuard::Exclusive {
                _guard: lock.write_owned().await,
            },
        }
    }

    /// Whether an exclusive holder or queued writer currently blocks readers.
    pub fn is_exclusive_held(&self) -> bool {
        self.lock.try_read().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::{Consistency, TransactionLock};
    use std::time::Duration;

    #[tokio::test]
    async fn exclusive_waits_for_readers_and_blocks_new_ones() {
        let lock = TransactionLock::new();
        let reader = lock.acquire(Consistency::Shared).await;
        assert_eq!(reader.consistency(), Consistency::Shared);
        let second = lock.acquire(Consistency::Shared).await;

        let writer =
            tokio::time::timeout(Duration::from_millis(20), lock.acquire(Consistency::Exclusive))
                .await;
        assert!(writer.is_err(), "writer must wait for readers");

        drop(reader);
        drop(second);
        let writer = lock.acquire(Consistency::Exclusive).await;
        assert_eq!(writer.consistency(), Consistency::Exclusive);
        assert!(lock.is_exclusive_held());

        let reader =
            tokio::time::timeout(Duration::from_millis(20), lock.acquire(Consistency::Shared))
                .await;
        assert!(reader.is_err(), "readers must wait for the writer");
        drop(writer);
        assert!(!lock.is_exclusive_held());
    }
}
