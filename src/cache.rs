use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded insertion-order map with optional expiry. Backs the response cache
/// (100 entries, 2 h TTL) and the query-embedding cache (200 entries, no TTL).
/// Eviction is FIFO on any insert that would exceed the cap; expired entries
/// are dropped on lookup and by the periodic cleaner.
pub struct FifoCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    ttl: Option<Duration>,
}

struct Inner<V> {
    entries: HashMap<String, (V, Instant)>,
    order: VecDeque<String>,
}

impl<V: Clone> FifoCache<V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        FifoCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(key) {
            Some((_, inserted)) => self.is_expired(*inserted),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        inner.entries.get(key).map(|(v, _)| v.clone())
    }

    pub fn insert(&self, key: String, value: V) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(&key).is_some() {
            inner.order.retain(|k| k != &key);
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, (value, Instant::now()));
    }

    /// Drop every expired entry. No-op for caches without a TTL.
    pub fn purge_expired(&self) {
        if self.ttl.is_none() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.ttl;
        let live: Vec<String> = inner
            .order
            .iter()
            .filter(|k| {
                inner
                    .entries
                    .get(*k)
                    .map(|(_, at)| ttl.map(|t| at.elapsed() < t).unwrap_or(true))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        inner.entries.retain(|_, (_, at)| {
            ttl.map(|t| at.elapsed() < t).unwrap_or(true)
        });
        inner.order = live.into();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, inserted: Instant) -> bool {
        match self.ttl {
            Some(ttl) => inserted.elapsed() >= ttl,
            None => false,
        }
    }
}

/// Cache keys are built from normalized queries so that formatting noise
/// (case, runs of whitespace) never splits identical lookups.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
