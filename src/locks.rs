//! Exclusive (repository, branch) locks with bounded waits.
//!
//! Each key gets a fair async mutex; waiters queue in arrival order. A lock
//! is released when its `LockHandle` is dropped, whichever way the holder
//! exits. Idle keys are removed from the table once nobody holds or waits on
//! them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LockError;

/// A lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceKey {
    pub repository: String,
    pub branch: String,
}

impl ResourceKey {
    pub fn new(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repository, self.branch)
    }
}

/// Who holds a lock and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockEntry {
    pub session_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    gate: Arc<tokio::sync::Mutex<()>>,
    holder: Option<LockEntry>,
    /// Holders plus waiters.
    refs: usize,
}

type Table = Arc<Mutex<HashMap<ResourceKey, Slot>>>;

/// Counts one holder or waiter on a key; removes the idle slot on drop.
#[derive(Debug)]
struct SlotRef {
    table: Table,
    key: ResourceKey,
}

impl SlotRef {
    fn register(table: &Table, key: &ResourceKey) -> (Self, Arc<tokio::sync::Mutex<()>>) {
        let mut slots = table.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            holder: None,
            refs: 0,
        });
        slot.refs += 1;
        let gate = Arc::clone(&slot.gate);
        (
            Self {
                table: Arc::clone(table),
                key: key.clone(),
            },
            gate,
        )
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let mut slots = self.table.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Proof of holding a resource lock.
#[derive(Debug)]
pub struct LockHandle {
    key: ResourceKey,
    session_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    slot: SlotRef,
}

impl LockHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let mut slots = self.slot.table.lock();
        if let Some(slot) = slots.get_mut(&self.key)
            && slot
                .holder
                .as_ref()
                .is_some_and(|h| h.session_id == self.session_id)
        {
            slot.holder = None;
        }
        // Hand over to the next waiter only after the holder is cleared.
        self.guard.take();
        drop(slots);
        debug!(key = %self.key, session_id = %self.session_id, "Released resource lock");
    }
}

/// Process-wide table of resource locks.
#[derive(Debug, Clone, Default)]
pub struct ResourceLockManager {
    table: Table,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive ownership of
    /// (`repository`, `branch`).
    pub async fn acquire(
        &self,
        repository: &str,
        branch: &str,
        session_id: Uuid,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let key = ResourceKey::new(repository, branch);
        let (slot, gate) = SlotRef::register(&self.table, &key);

        let guard = match tokio::time::timeout(timeout, gate.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                let holder = self.holder(repository, branch).map(|h| h.session_id);
                info!(key = %key, %session_id, ?holder, "Timed out waiting for resource lock");
                return Err(LockError::Timeout {
                    repository: key.repository,
                    branch: key.branch,
                    waited: timeout,
                    holder,
                });
            }
        };

        if let Some(entry) = self.table.lock().get_mut(&key) {
            entry.holder = Some(LockEntry {
                session_id,
                acquired_at: Utc::now(),
            });
        }
        debug!(key = %key, %session_id, "Acquired resource lock");

        Ok(LockHandle {
            key,
            session_id,
            guard: Some(guard),
            slot,
        })
    }

    /// Give the lock back. Equivalent to dropping the handle.
    pub fn release(&self, handle: LockHandle) {
        drop(handle);
    }

    /// Current holder of (`repository`, `branch`), if any.
    pub fn holder(&self, repository: &str, branch: &str) -> Option<LockEntry> {
        self.table
            .lock()
            .get(&ResourceKey::new(repository, branch))
            .and_then(|slot| slot.holder.clone())
    }

    /// Keys with a holder or a waiter.
    pub fn tracked(&self) -> usize {
        self.table.lock().len()
    }
}
