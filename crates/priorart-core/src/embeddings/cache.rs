//! Bounded least-recently-used cache for query embeddings

use std::collections::HashMap;

pub(crate) type CacheKey = (String, bool);

pub(crate) struct EmbeddingCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<CacheKey, (Vec<f32>, u64)>,
}

impl EmbeddingCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::with_capacity(capacity.min(1024)),
        }
    }

    pub(crate) fn get(&mut self, key: &CacheKey) -> Option<Vec<f32>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(vector, last_used)| {
            *last_used = tick;
            vector.clone()
        })
    }

    pub(crate) fn insert(&mut self, key: CacheKey, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // O(n) scan, capacity is small
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        self.entries.insert(key, (vector, self.tick));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
