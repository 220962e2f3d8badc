//! Fixed-capacity LRU store
//!
//! ```text
//!   index: HashMap<String, usize> ──► slots: Vec<Slot>
//!
//!   head ──► [D] ◄──► [A] ◄──► [B] ◄── tail
//!            MRU                LRU
//! ```
//!
//! Entries live in a slot arena and link to each other by slot index, so
//! the recency list has no owning back-pointers. Capacity counts entries,
//! not bytes. Once the arena is full, the tail slot is recycled in place
//! for the incoming key.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use shardcache_core::types::Mappings;
use shardcache_core::{Error, Result};

#[derive(Debug)]
struct Slot {
    key: String,
    value: String,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Single-threaded LRU core: hash index plus recency-ordered list
#[derive(Debug)]
pub struct LruCore {
    capacity: usize,
    index: HashMap<String, usize>,
    slots: Vec<Slot>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruCore {
    /// Create an empty core. A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key` and promote it to the head.
    pub fn get(&mut self, key: &str) -> Option<&str> {
        let idx = *self.index.get(key)?;
        self.move_to_head(idx);
        Some(self.slots[idx].value.as_str())
    }

    /// Insert or update `key`. Returns the evicted key, if any.
    pub fn put(&mut self, key: String, value: String) -> Option<String> {
        if let Some(&idx) = self.index.get(&key) {
            self.slots[idx].value = value;
            self.move_to_head(idx);
            return None;
        }

        if self.index.len() >= self.capacity {
            // Recycle the tail slot for the new entry
            let idx = self.tail?;
            self.detach(idx);
            let slot = &mut self.slots[idx];
            let evicted = std::mem::replace(&mut slot.key, key.clone());
            slot.value = value;
            self.index.remove(&evicted);
            self.index.insert(key, idx);
            self.attach_front(idx);
            return Some(evicted);
        }

        let idx = self.slots.len();
        self.slots.push(Slot {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.index.insert(key, idx);
        self.attach_front(idx);
        None
    }

    /// Least recently used key, the next eviction candidate
    pub fn peek_lru(&self) -> Option<&str> {
        self.tail.map(|idx| self.slots[idx].key.as_str())
    }

    /// Pairs ordered head to tail (most to least recent)
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let slot = &self.slots[idx];
            out.push((slot.key.clone(), slot.value.clone()));
            cursor = slot.next;
        }
        out
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.head = None;
        self.tail = None;
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.attach_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = &self.slots[idx];
            (slot.prev, slot.next)
        };

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }

        let slot = &mut self.slots[idx];
        slot.prev = None;
        slot.next = None;
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = &mut self.slots[idx];
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head {
            Some(h) => self.slots[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }
}

/// Thread-safe LRU store owned by one auxiliary node.
///
/// Every operation, including `entries` and `erase`, runs under the same
/// mutex so snapshots and flushes never interleave with live traffic.
#[derive(Debug)]
pub struct LruStore {
    inner: Mutex<LruCore>,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCore::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Fetch a value, promoting it to most recently used
    pub fn get(&self, key: &str) -> Result<String> {
        self.inner
            .lock()
            .get(key)
            .map(String::from)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let evicted = self.inner.lock().put(key.into(), value.into());
        if let Some(evicted) = evicted {
            debug!("Evicted least recently used key {}", evicted);
        }
    }

    /// Head-to-tail copy of the contents; does not change recency
    pub fn entries(&self) -> Vec<(String, String)> {
        self.inner.lock().entries()
    }

    /// Contents as a flat mapping (recency order is not preserved)
    pub fn mappings(&self) -> Mappings {
        self.entries().into_iter().collect()
    }

    /// Drop every entry
    pub fn erase(&self) {
        self.inner.lock().clear();
    }

    /// Replace the contents with `mappings`, inserted in iteration order.
    /// Entries beyond capacity evict earlier ones as usual.
    pub fn restore(&self, mappings: Mappings) {
        let mut inner = self.inner.lock();
        inner.clear();
        for (key, value) in mappings {
            inner.put(key, value);
        }
    }
}
