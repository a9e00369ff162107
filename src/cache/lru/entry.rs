//! Recency-ordered entry storage
//!
//! Entries live in a slot arena linked into a doubly linked list (head = most
//! recently used, tail = least recently used) with a hash index from key to
//! slot, so lookup, bump, insert and evict are all O(1).

use std::collections::HashMap;

use tokio::time::Instant;

use crate::cache::traits::CacheKey;

#[derive(Debug)]
pub(crate) struct CacheEntry<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    /// Absolute expiry; `None` never expires
    pub(crate) expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K, V> CacheEntry<K, V> {
    pub(crate) fn new(key: K, value: V, expires_at: Option<Instant>) -> Self {
        Self {
            key,
            value,
            expires_at,
            prev: None,
            next: None,
        }
    }

    #[inline]
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug)]
pub(crate) struct RecencyList<K, V> {
    slots: Vec<Option<CacheEntry<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: CacheKey, V> RecencyList<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn slot_of(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub(crate) fn entry(&self, slot: usize) -> Option<&CacheEntry<K, V>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn entry_mut(&mut self, slot: usize) -> Option<&mut CacheEntry<K, V>> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Insert a new entry at the most-recent position. The key must not
    /// already be present.
    pub(crate) fn push_front(&mut self, entry: CacheEntry<K, V>) -> usize {
        let key = entry.key.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_front(slot);
        slot
    }

    pub(crate) fn move_to_front(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.link_front(slot);
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<CacheEntry<K, V>> {
        self.entry(slot)?;
        self.unlink(slot);
        let entry = self.slots[slot].take()?;
        self.index.remove(&entry.key);
        self.free.push(slot);
        Some(entry)
    }

    /// Remove the least recently used entry
    pub(crate) fn pop_back(&mut self) -> Option<CacheEntry<K, V>> {
        let tail = self.tail?;
        self.remove(tail)
    }

    /// Slots from least to most recently used
    pub(crate) fn slots_lru_first(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            order.push(slot);
            cursor = self.entry(slot).and_then(|entry| entry.prev);
        }
        order
    }

    /// Keys from most to least recently used
    pub(crate) fn keys_mru_first(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(entry) = self.entry(slot) else { break };
            keys.push(entry.key.clone());
            cursor = entry.next;
        }
        keys
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(entry) = self.entry_mut(slot) {
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(head) = old_head {
            if let Some(old) = self.entry_mut(head) {
                old.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.entry(slot) {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(prev_entry) = self.entry_mut(p) {
                    prev_entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(next_entry) = self.entry_mut(n) {
                    next_entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(entry) = self.entry_mut(slot) {
            entry.prev = None;
            entry.next = None;
        }
    }
}
