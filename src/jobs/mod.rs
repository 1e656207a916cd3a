//! Job state tracking. The store is the single source of truth for a
//! research job's progress; the orchestrator is its only writer and any
//! number of API handlers read snapshots concurrently. Cancellation runs
//! through a separate flag registry so the store keeps exactly one writer
//! per job.

pub mod store;

pub use store::JobStore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cancellation flags, one per live job. The orchestrator and its fetch
/// workers poll the flag between tasks; the cancel endpoint sets it.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    flags: Arc<RwLock<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.write().await.insert(id, Arc::clone(&flag));
        flag
    }

    /// Returns false for unknown (or already deregistered) jobs.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.flags.read().await.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub async fn deregister(&self, id: Uuid) {
        self.flags.write().await.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_sets_the_registered_flag() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let flag = registry.register(id).await;

        assert!(!flag.load(Ordering::Relaxed));
        assert!(registry.cancel(id).await);
        assert!(flag.load(Ordering::Relaxed));

        registry.deregister(id).await;
        assert!(!registry.cancel(id).await);
    }
}
