//! Bounded accounting of outstanding image buffers.
//!
//! Every image the driver creates (raw copies, conversions, accumulators)
//! holds an [`ArrayLease`]. The lease returns its permit when the image is
//! dropped, wherever that happens (in the driver, in a sink, in a gang
//! peer). When all permits are out, allocation fails and the caller counts
//! the frame as dropped instead of growing memory without limit.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct PoolInner {
    /// `None` = unlimited
    semaphore: Option<Arc<Semaphore>>,
    max_arrays: usize,
}

/// Shared counter of image buffers in flight, capped at `max_arrays`.
#[derive(Debug, Clone)]
pub struct ArrayPool {
    inner: Arc<PoolInner>,
}

/// Permit for one outstanding image buffer. Released on drop.
#[derive(Debug)]
pub struct ArrayLease {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ArrayPool {
    /// Pool allowing `max_arrays` leases at once; 0 means unlimited.
    pub fn new(max_arrays: usize) -> Self {
        let semaphore = (max_arrays > 0).then(|| Arc::new(Semaphore::new(max_arrays)));
        Self {
            inner: Arc::new(PoolInner {
                semaphore,
                max_arrays,
            }),
        }
    }

    /// Take a permit, or `None` if the pool is exhausted.
    pub fn lease(&self) -> Option<ArrayLease> {
        let Some(semaphore) = &self.inner.semaphore else {
            return Some(ArrayLease { _permit: None });
        };
        let permit = Arc::clone(semaphore).try_acquire_owned().ok()?;
        Some(ArrayLease {
            _permit: Some(permit),
        })
    }

    /// Leases currently held. Always 0 for an unlimited pool.
    pub fn outstanding(&self) -> usize {
        self.inner
            .semaphore
            .as_ref()
            .map_or(0, |s| self.inner.max_arrays - s.available_permits())
    }
}
