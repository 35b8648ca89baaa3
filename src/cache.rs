//! Render Cache - Bounded LRU of Completed Renders
//!
//! Keys already fold in the dependency epoch, so any artifact change makes
//! older entries unreachable; they age out through normal eviction.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::scene::RenderOutput;

pub const DEFAULT_CACHE_CAPACITY: usize = 24;

pub struct RenderCache {
    capacity: usize,
    entries: HashMap<String, RenderOutput>,
    /// Least recently used first
    order: VecDeque<String>,
}

impl RenderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<RenderOutput> {
        let Some(entry) = self.entries.get(key) else {
            debug!(key, "render cache miss");
            return None;
        };
        let entry = entry.clone();
        self.touch(key);
        debug!(key, "render cache hit");
        Some(entry)
    }

    pub fn put(&mut self, key: String, output: RenderOutput) {
        if self.entries.insert(key.clone(), output).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(key = %oldest, "render cache eviction");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
