//! Time-bounded key/value memory. Expired entries are dropped on the read
//! path and reported as misses; with access refresh enabled a hit pushes the
//! deadline out again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    refresh_on_access: bool,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_refresh(ttl, false)
    }

    pub fn with_refresh(ttl: Duration, refresh_on_access: bool) -> Self {
        Self {
            ttl,
            refresh_on_access,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("ttl cache poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                if self.refresh_on_access {
                    entry.expires_at = now + self.ttl;
                }
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().expect("ttl cache poisoned");
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("ttl cache poisoned");
        entries.remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.lock().expect("ttl cache poisoned").clear();
    }

    /// Live entry count. Expired entries that have not been touched since
    /// their deadline still count until a read evicts them.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("ttl cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
