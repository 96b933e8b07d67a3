//! Size-bounded key/value cache shared with the peer group.
//!
//! The cache is told the address of every known peer whenever the registry
//! changes. Values are produced locally by a getter on a miss; the peer set
//! is kept so ownership of keys can be distributed across peers later.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Produces the value for a key missing from the cache.
pub type Getter = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;

pub struct PeerCache {
    name: String,
    max_bytes: usize,
    used_bytes: AtomicUsize,
    entries: DashMap<String, Vec<u8>>,
    peers: RwLock<Vec<String>>,
    getter: RwLock<Option<Getter>>,
}

impl std::fmt::Debug for PeerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCache")
            .field("name", &self.name)
            .field("max_bytes", &self.max_bytes)
            .field("used_bytes", &self.used_bytes())
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl PeerCache {
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            name: name.into(),
            max_bytes,
            used_bytes: AtomicUsize::new(0),
            entries: DashMap::new(),
            peers: RwLock::new(Vec::new()),
            getter: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the function that fills misses.
    pub fn set_getter(&self, getter: Getter) {
        *self.getter.write().unwrap_or_else(|e| e.into_inner()) = Some(getter);
    }

    /// Replace the known peer set.
    pub fn set_peers(&self, addrs: Vec<String>) {
        debug!(cache = %self.name, peers = addrs.len(), "Cache peer set updated");
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = addrs;
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Look `key` up, filling it from the getter on a miss.
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.entries.get(key) {
            return Some(value.value().clone());
        }
        let getter = self
            .getter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        let value = getter(key)?;
        self.insert(key, value.clone());
        Some(value)
    }

    /// Like [`get_bytes`](Self::get_bytes), for UTF-8 values.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_bytes(key).and_then(|b| String::from_utf8(b).ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently held. Approximate under concurrent inserts.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn insert(&self, key: &str, value: Vec<u8>) {
        let size = key.len() + value.len();
        if size > self.max_bytes {
            return;
        }
        // Evict arbitrary entries until the new value fits
        while self.used_bytes() + size > self.max_bytes {
            let victim = match self.entries.iter().next() {
                Some(entry) => entry.key().clone(),
                None => break,
            };
            if let Some((k, v)) = self.entries.remove(&victim) {
                self.used_bytes.fetch_sub(k.len() + v.len(), Ordering::Relaxed);
            }
        }
        if let Some(old) = self.entries.insert(key.to_string(), value) {
            self.used_bytes.fetch_sub(key.len() + old.len(), Ordering::Relaxed);
        }
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
    }
}
