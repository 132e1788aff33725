//! Bounded pools for work which spawns subprocesses or issues network
//! requests.
//!
//! The pipeline uses two pools: one sized to the CPU count for git
//! subprocesses, and one of fixed size for forge HTTP requests. Acquiring a
//! permit suspends the caller until a slot frees up, which bounds the number
//! of concurrent subprocesses/requests without any explicit scheduling.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent forge HTTP requests.
pub const DEFAULT_FORGE_CONCURRENCY: usize = 8;

/// A bounded pool of permits for concurrent work.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<WorkerPool size={} available={}>",
            self.size,
            self.semaphore.available_permits()
        )
    }
}

impl WorkerPool {
    /// Construct a pool with the given number of permits.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// A pool sized for git subprocesses (one permit per CPU).
    pub fn for_git() -> Self {
        Self::new(num_cpus::get())
    }

    /// A pool sized for forge HTTP requests.
    pub fn for_forge() -> Self {
        Self::new(DEFAULT_FORGE_CONCURRENCY)
    }

    /// The total number of permits.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a slot in the pool. The slot is released when the returned
    /// permit is dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("Worker pool semaphore was closed")
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let permit1 = pool.acquire().await;
        let _permit2 = pool.acquire().await;
        assert_eq!(pool.size(), 2);

        // A third acquire would block; after releasing a permit, it proceeds.
        drop(permit1);
        let _permit3 = pool.acquire().await;
    }

    #[test]
    fn test_pool_minimum_size() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }
}
