// Worker Pool
// Bounded pool of isolated workers; each lease is released exactly once

use crate::error::{ServiceError, ServiceResult};
use crate::execution::cancel::CancelSignal;

use indexmap::IndexMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An isolated execution environment owned by one job for its duration
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: usize,
    /// Repository checkout root, the default working directory for steps
    pub checkout_dir: PathBuf,
    /// Per-worker scratch space, removed on release
    pub scratch_dir: PathBuf,
    /// Environment overlay from provisioning and `export-env`
    pub env: IndexMap<String, String>,
    /// Services started during provisioning, in start order
    pub services: Vec<String>,
    /// Runtime version descriptor selected by provisioning
    pub runtime_version: Option<String>,
}

impl WorkerHandle {
    /// A handle that belongs to no pool (tests, one-off execution)
    pub fn detached(id: usize, checkout_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            checkout_dir: checkout_dir.into(),
            scratch_dir: scratch_dir.into(),
            env: IndexMap::new(),
            services: Vec::new(),
            runtime_version: None,
        }
    }

    /// Persist a variable for every later step on this worker
    pub fn export(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }
}

/// Snapshot of pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub acquired: usize,
    pub released: usize,
}

impl PoolStats {
    pub fn in_use(&self) -> usize {
        self.acquired - self.released
    }
}

/// Hands out workers, at most `limit` at a time
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Option<Arc<Semaphore>>,
    limit: Option<usize>,
    checkout_dir: PathBuf,
    scratch_root: PathBuf,
    next_id: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl WorkerPool {
    /// `limit` of None gives every job instance its own worker immediately
    pub fn new(limit: Option<usize>, checkout_dir: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Arc<Self> {
        let limit = limit.filter(|n| *n > 0);
        Arc::new(Self {
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
            limit,
            checkout_dir: checkout_dir.into(),
            scratch_root: scratch_root.into(),
            next_id: AtomicUsize::new(1),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn checkout_dir(&self) -> &Path {
        &self.checkout_dir
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }

    /// Wait for a free worker. Returns [`ServiceError::Cancelled`] if the run
    /// is cancelled while queued.
    pub async fn acquire(self: &Arc<Self>, run_id: Uuid, cancel: &mut CancelSignal) -> ServiceResult<WorkerLease> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        let permit = match &self.semaphore {
            Some(semaphore) => {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit
                        .map_err(|_| ServiceError::Internal("worker pool closed".to_string()))?,
                    _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
                };
                Some(permit)
            }
            None => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let scratch_dir = self
            .scratch_root
            .join(run_id.to_string())
            .join(format!("worker-{}", id));
        tokio::fs::create_dir_all(&scratch_dir).await?;

        self.acquired.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker_id = id, scratch = %scratch_dir.display(), "worker acquired");

        Ok(WorkerLease {
            worker: WorkerHandle::detached(id, self.checkout_dir.clone(), scratch_dir),
            permit,
            pool: Arc::clone(self),
            released: false,
        })
    }
}

/// Exclusive use of a worker. Dropping the lease releases it; [`release`]
/// additionally cleans the scratch directory asynchronously.
///
/// [`release`]: WorkerLease::release
#[derive(Debug)]
pub struct WorkerLease {
    worker: WorkerHandle,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<WorkerPool>,
    released: bool,
}

impl WorkerLease {
    pub fn id(&self) -> usize {
        self.worker.id
    }

    /// Remove the scratch directory and hand the slot back to the pool
    pub async fn release(mut self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.worker.scratch_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(worker_id = self.worker.id, error = %e, "failed to clean scratch directory");
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.permit.take();
        self.pool.released.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker_id = self.worker.id, "worker released");
    }
}

impl Deref for WorkerLease {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        &self.worker
    }
}

impl DerefMut for WorkerLease {
    fn deref_mut(&mut self) -> &mut WorkerHandle {
        &mut self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_dir_all(&self.worker.scratch_dir);
            self.finish();
        }
    }
}
