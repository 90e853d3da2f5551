//! Per-sandbox transition serialization.
//!
//! Status writes for one sandbox are serialized through a `Semaphore(1)`
//! keyed on the sandbox id; transitions for different sandboxes run
//! independently. The permit is held across the whole transition, including
//! the backend call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

pub struct SandboxLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for SandboxLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxLockMap {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    /// Acquire the transition lock for a sandbox. The permit auto-releases
    /// on drop.
    pub async fn acquire(&self, sandbox_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(sandbox_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquire cannot fail.
        sem.acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("sandbox lock semaphore closed"))
    }

    /// Drop map entries whose permit is free (no transition in flight).
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_sandbox_serializes() {
        let map = Arc::new(SandboxLockMap::new());
        let id = Uuid::new_v4();
        let permit = map.acquire(id).await;

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire(id).await;
            7
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(permit);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn distinct_sandboxes_run_independently() {
        let map = SandboxLockMap::new();
        let _a = map.acquire(Uuid::new_v4()).await;
        let _b = map.acquire(Uuid::new_v4()).await;
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let map = SandboxLockMap::new();
        let id = Uuid::new_v4();
        let permit = map.acquire(id).await;
        let _free = map.acquire(Uuid::new_v4()).await;
        drop(_free);
        map.prune_idle();
        assert_eq!(map.len(), 1);
        drop(permit);
        map.prune_idle();
        assert!(map.is_empty());
    }
}
