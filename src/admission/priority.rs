use crate::error::OlapError;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Counting semaphore whose wait queue is ordered by priority.
///
/// When a permit is returned it is handed directly to the highest-priority
/// waiter (earliest arrival on ties), so `available > 0` implies the queue is
/// empty. Waiting is cancelled by dropping the future; a permit that was
/// handed to a waiter which gave up in the same instant is passed on.
/// Cancelled waiters are pruned from the queue as it grows.
#[derive(Debug, Clone)]
pub struct PrioritySemaphore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    state: Mutex<State>,
}

/// Queue length at which cancelled waiters are first pruned.
const PRUNE_MIN: usize = 32;

#[derive(Debug)]
struct State {
    available: usize,
    next_seq: u64,
    closed: bool,
    prune_at: usize,
    waiters: BinaryHeap<Waiter>,
}

impl State {
    fn push(&mut self, waiter: Waiter) {
        if self.waiters.len() >= self.prune_at {
            self.waiters.retain(|w| !w.tx.is_closed());
            self.prune_at = (self.waiters.len() * 2).max(PRUNE_MIN);
        }
        self.waiters.push(waiter);
    }
}

#[derive(Debug)]
struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PrioritySemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State {
                    available: capacity,
                    next_seq: 0,
                    closed: false,
                    prune_at: PRUNE_MIN,
                    waiters: BinaryHeap::new(),
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Waiters still registered, including ones whose future was dropped but
    /// not yet skipped by a release.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Fails queued and future acquisitions with [`OlapError::Closed`].
    /// Permits already handed out stay valid.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        // dropping the senders wakes every waiter
        state.waiters.clear();
    }

    pub fn try_acquire(&self) -> Option<PriorityPermit> {
        let mut state = self.inner.state.lock();
        if !state.closed && state.available > 0 {
            state.available -= 1;
            return Some(self.permit());
        }
        None
    }

    pub async fn acquire(&self, priority: i32) -> Result<PriorityPermit, OlapError> {
        loop {
            let rx = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(OlapError::Closed);
                }
                if state.available > 0 {
                    state.available -= 1;
                    return Ok(self.permit());
                }
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.push(Waiter { priority, seq, tx });
                rx
            };
            let mut pending = PendingAcquire {
                rx: Some(rx),
                inner: Arc::clone(&self.inner),
            };
            let admitted = match pending.rx.as_mut() {
                Some(rx) => rx.await.is_ok(),
                None => false,
            };
            pending.rx = None;
            if admitted {
                return Ok(self.permit());
            }
        }
    }

    fn permit(&self) -> PriorityPermit {
        PriorityPermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Inner {
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        state.available += 1;
        debug_assert!(state.available <= self.capacity);
    }
}

/// Guards a waiter that may be cancelled after its permit was sent.
struct PendingAcquire {
    rx: Option<oneshot::Receiver<()>>,
    inner: Arc<Inner>,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.inner.release();
            }
        }
    }
}

#[derive(Debug)]
pub struct PriorityPermit {
    inner: Arc<Inner>,
}

impl Drop for PriorityPermit {
    fn drop(&mut self) {
        self.inner.release();
    }
}
