use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::StageError;

/// Admission-bounded task spawner.
///
/// `spawn` returns immediately; the spawned task acquires a pool permit
/// before the work future runs, so at most `capacity` workers execute at
/// once and the excess queue on the semaphore. The controller therefore
/// never blocks on a full pool.
pub(crate) struct TaskPool {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl TaskPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn spawn<T, F>(&self, fut: F) -> JoinHandle<Result<T, StageError>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StageError>> + Send + 'static,
    {
        let sem = Arc::clone(&self.sem);
        tokio::spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(StageError::PoolClosed),
            };
            fut.await
        })
    }

    pub(crate) fn shutdown(&self) {
        self.sem.close();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.sem.is_closed()
    }
}

/// The three execution lanes behind the pipeline.
///
/// Two identically sized bounded pools carry pooled stages: ordinary pooled
/// work and the upstream half of a paired run go to `primary`, the
/// downstream half of a paired run always goes to `secondary`. A paired run
/// holds two workers at once; with a single pool, a saturated set of
/// upstream halves parked on pipe writes could keep every downstream half
/// (the only tasks that would drain those pipes) from being admitted. The
/// split guarantees a downstream slot whenever an upstream half is admitted.
/// Inline stages bypass the pools and run unbounded on the runtime.
pub(crate) struct PoolSet {
    primary: TaskPool,
    secondary: TaskPool,
    inline_shut: AtomicBool,
}

impl PoolSet {
    /// Size each bounded pool to `max_simultaneous + 2` when configured (the
    /// headroom covers transient overlap between stages of different items),
    /// else to the host's available parallelism.
    pub(crate) fn new(max_simultaneous: Option<usize>) -> Self {
        let capacity = match max_simultaneous {
            Some(n) => n + 2,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        };
        debug!(capacity, "worker pools sized");
        Self {
            primary: TaskPool::new(capacity),
            secondary: TaskPool::new(capacity),
            inline_shut: AtomicBool::new(false),
        }
    }

    pub(crate) fn primary(&self) -> &TaskPool {
        &self.primary
    }

    pub(crate) fn secondary(&self) -> &TaskPool {
        &self.secondary
    }

    /// Unbounded lane for inline stages.
    pub(crate) fn spawn_inline<T, F>(&self, fut: F) -> JoinHandle<Result<T, StageError>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StageError>> + Send + 'static,
    {
        if self.inline_shut.load(Ordering::Acquire) {
            return tokio::spawn(async { Err(StageError::PoolClosed) });
        }
        tokio::spawn(fut)
    }

    pub(crate) fn shutdown(&self) {
        self.primary.shutdown();
        self.secondary.shutdown();
        self.inline_shut.store(true, Ordering::Release);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.primary.is_shut_down()
            && self.secondary.is_shut_down()
            && self.inline_shut.load(Ordering::Acquire)
    }
}
