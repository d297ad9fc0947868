//! Reference-counted cache of materialized workspaces.
//!
//! Keyed by (repository, reference). Concurrent acquirers of the same key
//! share one materialization. Entries are only discarded once no handle
//! refers to them: invalidated and evicted entries are detached from the
//! table right away and cleaned up when their last handle is released.

pub mod materializer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;

pub use materializer::{GitMaterializer, Materializer};

/// Identity of a cached workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub repository: String,
    pub reference: String,
}

impl CacheKey {
    pub fn new(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: reference.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repository, self.reference)
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: Option<PathBuf>,
    pub materialized_at: Option<DateTime<Utc>>,
    pub refs: usize,
}

#[derive(Debug)]
struct Workspace {
    path: PathBuf,
    materialized_at: DateTime<Utc>,
    validated_at: Instant,
}

#[derive(Debug)]
struct SlotMeta {
    refs: usize,
    last_used: Instant,
    detached: bool,
}

#[derive(Debug)]
struct Slot {
    key: CacheKey,
    workspace: OnceCell<Workspace>,
    meta: Mutex<SlotMeta>,
}

impl Slot {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            workspace: OnceCell::new(),
            meta: Mutex::new(SlotMeta {
                refs: 0,
                last_used: Instant::now(),
                detached: false,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    slots: HashMap<CacheKey, Arc<Slot>>,
    /// Workspaces waiting to be discarded.
    doomed: Vec<PathBuf>,
}

impl Table {
    /// Remove `slot` from lookups; its workspace is discarded once idle.
    fn detach(&mut self, slot: &Arc<Slot>) {
        if self
            .slots
            .get(&slot.key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            self.slots.remove(&slot.key);
        }
        let mut meta = slot.meta.lock();
        if meta.detached {
            return;
        }
        meta.detached = true;
        if meta.refs == 0
            && let Some(ws) = slot.workspace.get()
        {
            self.doomed.push(ws.path.clone());
        }
    }
}

struct Inner {
    materializer: Arc<dyn Materializer>,
    capacity: usize,
    ttl: Duration,
    materialize_timeout: Duration,
    table: Mutex<Table>,
}

/// Shared workspace cache.
#[derive(Clone)]
pub struct CodebaseCache {
    inner: Arc<Inner>,
}

/// A counted reference to a cached workspace.
///
/// Dropping the handle releases the reference; prefer
/// [`CodebaseCache::release`] so cleanup of detached entries runs promptly.
pub struct WorkspaceHandle {
    inner: Arc<Inner>,
    slot: Arc<Slot>,
    path: PathBuf,
}

impl WorkspaceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &CacheKey {
        &self.slot.key
    }
}

impl std::fmt::Debug for WorkspaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceHandle")
            .field("key", &self.slot.key)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for WorkspaceHandle {
    fn drop(&mut self) {
        let mut table = self.inner.table.lock();
        let mut meta = self.slot.meta.lock();
        meta.refs = meta.refs.saturating_sub(1);
        meta.last_used = Instant::now();
        if meta.refs == 0
            && meta.detached
            && let Some(ws) = self.slot.workspace.get()
        {
            table.doomed.push(ws.path.clone());
        }
    }
}

impl CodebaseCache {
    pub fn new(config: &CacheConfig, materializer: Arc<dyn Materializer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                materializer,
                capacity: config.capacity.max(1),
                ttl: config.ttl,
                materialize_timeout: config.materialize_timeout,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Get a workspace for `repository` at `reference`, materializing it if
    /// there is no usable entry. The caller holds a reference until the
    /// handle is released.
    pub async fn acquire(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<WorkspaceHandle, CacheError> {
        let key = CacheKey::new(repository, reference);
        let slot = {
            let mut table = self.inner.table.lock();
            let now = Instant::now();

            let stale = table.slots.get(&key).and_then(|existing| {
                let expired = existing
                    .workspace
                    .get()
                    .is_some_and(|ws| now.saturating_duration_since(ws.validated_at) >= self.inner.ttl);
                let idle = existing.meta.lock().refs == 0;
                (expired && idle).then(|| Arc::clone(existing))
            });
            if let Some(stale) = stale {
                debug!(key = %key, "Cache entry expired");
                table.detach(&stale);
            }

            let slot = Arc::clone(
                table
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Slot::new(key.clone()))),
            );
            let mut meta = slot.meta.lock();
            meta.refs += 1;
            meta.last_used = now;
            drop(meta);
            slot
        };

        // Created before materializing so an abandoned acquire still drops its reference.
        let mut handle = WorkspaceHandle {
            inner: Arc::clone(&self.inner),
            slot: Arc::clone(&slot),
            path: PathBuf::new(),
        };

        let workspace = slot
            .workspace
            .get_or_try_init(|| self.materialize(&key))
            .await?;
        handle.path = workspace.path.clone();

        self.evict_idle();
        self.flush().await;
        Ok(handle)
    }

    /// Drop `handle`'s reference and discard anything that became idle.
    pub async fn release(&self, handle: WorkspaceHandle) {
        drop(handle);
        self.flush().await;
    }

    /// Detach the entry for `repository` at `reference` so the next acquire
    /// materializes afresh. Returns whether there was an entry.
    pub async fn invalidate(&self, repository: &str, reference: &str) -> bool {
        let key = CacheKey::new(repository, reference);
        let existed = {
            let mut table = self.inner.table.lock();
            match table.slots.get(&key).cloned() {
                Some(slot) => {
                    table.detach(&slot);
                    true
                }
                None => false,
            }
        };
        if existed {
            info!(key = %key, "Invalidated cached workspace");
        }
        self.flush().await;
        existed
    }

    /// Entries currently reachable by key.
    pub fn len(&self) -> usize {
        self.inner.table.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, repository: &str, reference: &str) -> Option<CacheEntry> {
        let key = CacheKey::new(repository, reference);
        let table = self.inner.table.lock();
        table.slots.get(&key).map(|slot| {
            let ws = slot.workspace.get();
            CacheEntry {
                key: key.clone(),
                path: ws.map(|w| w.path.clone()),
                materialized_at: ws.map(|w| w.materialized_at),
                refs: slot.meta.lock().refs,
            }
        })
    }

    async fn materialize(&self, key: &CacheKey) -> Result<Workspace, CacheError> {
        debug!(key = %key, "Materializing workspace");
        let path = tokio::time::timeout(
            self.inner.materialize_timeout,
            self.inner.materializer.materialize(key),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            repository: key.repository.clone(),
            reference: key.reference.clone(),
            timeout: self.inner.materialize_timeout,
        })??;
        Ok(Workspace {
            path,
            materialized_at: Utc::now(),
            validated_at: Instant::now(),
        })
    }

    /// Detach least-recently-used idle entries until within capacity.
    fn evict_idle(&self) {
        let mut table = self.inner.table.lock();
        while table.slots.len() > self.inner.capacity {
            let victim = table
                .slots
                .values()
                .filter_map(|slot| {
                    let meta = slot.meta.lock();
                    (meta.refs == 0).then(|| (meta.last_used, Arc::clone(slot)))
                })
                .min_by_key(|(last_used, _)| *last_used)
                .map(|(_, slot)| slot);
            match victim {
                Some(slot) => {
                    debug!(key = %slot.key, "Evicting idle workspace");
                    table.detach(&slot);
                }
                None => break,
            }
        }
    }

    /// Discard workspaces that are detached and idle.
    async fn flush(&self) {
        let doomed = std::mem::take(&mut self.inner.table.lock().doomed);
        for path in doomed {
            if let Err(e) = self.inner.materializer.discard(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to discard workspace");
            }
        }
    }
}
