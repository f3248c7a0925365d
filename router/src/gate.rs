/// Per-instance admission control
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate bounding the in-flight requests of one instance
///
/// Waiters are queued FIFO by the underlying tokio semaphore and a released
/// permit is handed directly to the head of the queue. There is no timeout on
/// `acquire`: callers bound the whole request instead.
#[derive(Clone, Debug)]
pub struct ConcurrencyGate {
    inner: Arc<GateState>,
}

#[derive(Debug)]
struct GateState {
    semaphore: Arc<Semaphore>,
    /// Permit count the gate was built with
    permits: usize,
    /// Acquirers currently suspended
    waiting: AtomicUsize,
    /// Number of permits given back so far
    releases: AtomicUsize,
}

#[derive(Debug, Error)]
#[error("Concurrency gate is closed")]
pub struct GateClosed;

impl ConcurrencyGate {
    /// Create a gate with `permits` slots; a gate always admits at least one request
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            inner: Arc::new(GateState {
                semaphore: Arc::new(Semaphore::new(permits)),
                permits,
                waiting: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot. The slot is given back when the permit is dropped.
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        // Decrement on every exit path, including when the caller drops this future
        let _waiting = WaitingGuard(&self.inner.waiting);
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;

        Ok(GatePermit {
            _permit: permit,
            gate: self.inner.clone(),
        })
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.inner
            .semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit {
                _permit: permit,
                gate: self.inner.clone(),
            })
    }

    /// Slot count this gate was built with
    pub fn permits(&self) -> usize {
        self.inner.permits
    }

    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.permits - self.available_permits().min(self.inner.permits)
    }

    /// Number of acquirers suspended in the wait queue
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Total number of permits released since creation
    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// True if both handles point to the same gate
    pub fn same_gate(&self, other: &ConcurrencyGate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof of admission. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    gate: Arc<GateState>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.releases.fetch_add(1, Ordering::SeqCst);
    }
}
