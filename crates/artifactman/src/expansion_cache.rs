use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::{Mutex, RwLock};

use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::model::Expansion;

/// `(url|version, expansion parameters hash)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub canonical: CanonicalReference,
    pub params_hash: String,
}

impl CacheKey {
    pub fn new(canonical: CanonicalReference, params_hash: impl Into<String>) -> Self {
        Self {
            canonical,
            params_hash: params_hash.into(),
        }
    }
}

/// Change notification that evicts cached expansions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceChange {
    Updated(CanonicalReference),
    Deleted(CanonicalReference),
    Reset,
}

/// Cloneable sender side of the cache invalidation feed.
#[derive(Clone, Debug)]
pub struct CacheNotifier {
    sender: Sender<ResourceChange>,
}

impl CacheNotifier {
    pub fn notify(&self, change: ResourceChange) -> Result<(), ArtifactError> {
        self.sender.send(change).map_err(|_| {
            ArtifactError::Workspace("expansion cache is no longer listening".into())
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Value-set expansions shared across package operations.
pub struct ExpansionCache {
    entries: RwLock<HashMap<CacheKey, Expansion>>,
    sender: Sender<ResourceChange>,
    receiver: Mutex<Receiver<ResourceChange>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Default for ExpansionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpansionCache {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            entries: RwLock::new(HashMap::new()),
            sender,
            receiver: Mutex::new(receiver),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn notifier(&self) -> CacheNotifier {
        CacheNotifier {
            sender: self.sender.clone(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Expansion> {
        self.drain_notifications();
        let found = self.entries.read().get(key).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Stores an expansion unless the key is already cached; returns whether it was stored.
    pub fn insert_if_absent(&self, key: CacheKey, expansion: Expansion) -> bool {
        self.drain_notifications();
        let mut guard = self.entries.write();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, expansion);
        true
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }

    /// Evicts every entry for the url, or only the exact version when one is given.
    pub fn invalidate_canonical(&self, canonical: &CanonicalReference) {
        let mut guard = self.entries.write();
        let before = guard.len();
        guard.retain(|key, _| match canonical.version() {
            Some(_) => &key.canonical != canonical,
            None => !key.canonical.same_url(canonical),
        });
        tracing::debug!(
            canonical = %canonical,
            evicted = before - guard.len(),
            "invalidated cached expansions"
        );
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn drain_notifications(&self) {
        let pending: Vec<ResourceChange> = self.receiver.lock().try_iter().collect();
        for change in pending {
            match change {
                ResourceChange::Updated(canonical) | ResourceChange::Deleted(canonical) => {
                    self.invalidate_canonical(&canonical)
                }
                ResourceChange::Reset => self.clear(),
            }
        }
    }
}
