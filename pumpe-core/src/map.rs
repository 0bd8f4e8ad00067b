//! A typed concurrent map from gate id to gate, with uniform random pick.

use dashmap::DashMap;
use rand::Rng;
use uuid::Uuid;

/// Concurrent `id -> Arc<gate>` mapping. All operations are safe under
/// concurrent readers and writers; iteration order is unspecified.
#[derive(Debug)]
pub struct GateMap<V> {
    inner: DashMap<Uuid, std::sync::Arc<V>>,
}

impl<V> Default for GateMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> GateMap<V> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: DashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<std::sync::Arc<V>> {
        self.inner.get(id).map(|entry| entry.value().clone())
    }

    pub fn set(&self, id: Uuid, value: std::sync::Arc<V>) {
        self.inner.insert(id, value);
    }

    pub fn remove(&self, id: &Uuid) {
        self.inner.remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> Vec<Uuid> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }

    pub fn values(&self) -> Vec<std::sync::Arc<V>> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Uniformly pick one entry: choose `r` in `[0, len)` and take the
    /// `r`-th entry of the iteration. `None` on an empty map. A concurrent
    /// removal can shrink the map under us, in which case the first entry
    /// still present is returned instead.
    pub fn random(&self) -> Option<std::sync::Arc<V>> {
        let n = self.inner.len();
        if n == 0 {
            return None;
        }

        let r = rand::thread_rng().gen_range(0..n);

        self.inner
            .iter()
            .nth(r)
            .map(|entry| entry.value().clone())
            .or_else(|| self.inner.iter().next().map(|entry| entry.value().clone()))
    }
}
