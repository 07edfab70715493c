//! Bounded TTL'd LRU from session key to upstream id.
//!
//! Used by the HTTP front when `selection.sticky.mode = lru`. Entries carry
//! an absolute expiry; a hit renews the LRU position but never the TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Item {
    upstream_id: String,
    expires_at: Instant,
    stamp: u64,
}

struct Inner {
    items: HashMap<String, Item>,
    // LRU order: smallest stamp is the least recently used key.
    order: BTreeMap<u64, String>,
    clock: u64,
}

pub struct StickyMap {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner>,
}

impl StickyMap {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                order: BTreeMap::new(),
                clock: 0,
            }),
        }
    }

    /// Look up a session binding. Expired entries are evicted and miss.
    pub fn get(&self, key: &str, now: Instant) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.items.get(key) {
            None => return None,
            Some(item) => now >= item.expires_at,
        };
        if expired {
            if let Some(item) = inner.items.remove(key) {
                inner.order.remove(&item.stamp);
            }
            return None;
        }

        inner.clock += 1;
        let stamp = inner.clock;
        let item = inner.items.get_mut(key).unwrap();
        let old_stamp = item.stamp;
        item.stamp = stamp;
        let upstream = item.upstream_id.clone();
        inner.order.remove(&old_stamp);
        inner.order.insert(stamp, key.to_string());
        Some(upstream)
    }

    /// Insert or refresh a binding with a fresh TTL, evicting the least
    /// recently used entry when over capacity.
    pub fn set(&self, key: &str, upstream_id: &str, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let stamp = inner.clock;

        if let Some(old) = inner.items.remove(key) {
            inner.order.remove(&old.stamp);
        }
        inner.items.insert(
            key.to_string(),
            Item {
                upstream_id: upstream_id.to_string(),
                expires_at: now + self.ttl,
                stamp,
            },
        );
        inner.order.insert(stamp, key.to_string());

        while inner.items.len() > self.max_entries {
            let lru_key = match inner.order.iter().next() {
                Some((&stamp, key)) => (stamp, key.clone()),
                None => break,
            };
            inner.order.remove(&lru_key.0);
            inner.items.remove(&lru_key.1);
        }
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.remove(key) {
            inner.order.remove(&item.stamp);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
