//! Storage seams for vouchers and redirect records.
//!
//! The protocol engines only need load/store; persistence, expiry
//! sweeps and sharing across processes belong to the host.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::keys::SignatureBlock;

/// Keyed load/store of protocol objects.
pub trait ObjectStorage<K, V>: Send + Sync {
    fn load(&self, key: &K) -> Option<V>;
    fn store(&self, key: K, value: V);
}

/// A plain in-memory store.
pub struct MemoryStorage<K, V> {
    map: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for MemoryStorage<K, V> {
    fn default() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }
}

impl<K, V> MemoryStorage<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V> ObjectStorage<K, V> for MemoryStorage<K, V>
where
    K: std::hash::Hash + Eq + Send,
    V: Clone + Send,
{
    fn load(&self, key: &K) -> Option<V> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn store(&self, key: K, value: V) {
        self.map.lock().unwrap().insert(key, value);
    }
}

/// A cached rendezvous redirect: the signed `to1d` block plus its
/// expiry, derived from the wait-seconds the rendezvous granted.
#[derive(Debug, Clone)]
pub struct RedirectRecord {
    pub to1d: SignatureBlock,
    pub expires_at: Instant,
}

impl RedirectRecord {
    pub fn new(to1d: SignatureBlock, wait: Duration) -> Self {
        Self { to1d, expires_at: Instant::now() + wait }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}
