//! Open-addressed hash table
//!
//! Linear probing with tombstones, growing by `max(8, 2 * capacity)` when
//! the load (live entries plus tombstones) would pass 75%. One table type
//! backs the globals, the string intern pool, and map objects.
//!
//! Each full entry caches its key's hash so growth and probing never
//! consult the heap; key comparison is plain `Value` equality (identity
//! for objects, which is content equality for interned strings).

use crate::heap::{Heap, ObjId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Entry {
    /// Never occupied; terminates a probe sequence.
    Vacant,
    /// Previously occupied; probes continue past it and inserts may reuse it.
    Tombstone,
    Full(FullEntry),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FullEntry {
    pub key: Value,
    pub hash: u32,
    pub value: Value,
}

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Full entries plus tombstones; drives the load factor.
    count: usize,
    /// Full entries only.
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// Number of live key/value pairs.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[self.find_slot(key, hash)] {
            Entry::Full(entry) => Some(entry.value),
            _ => None,
        }
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if (self.count + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }

        let index = self.find_slot(key, hash);
        match &mut self.entries[index] {
            Entry::Full(entry) => {
                entry.value = value;
                false
            }
            slot => {
                // Reusing a tombstone does not change the load count; it was
                // already counted when first occupied.
                if matches!(slot, Entry::Vacant) {
                    self.count += 1;
                }
                *slot = Entry::Full(FullEntry { key, hash, value });
                self.live += 1;
                true
            }
        }
    }

    /// Remove a key, leaving a tombstone so later probes keep working.
    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_slot(key, hash);
        match self.entries[index] {
            Entry::Full(_) => {
                self.entries[index] = Entry::Tombstone;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Full(e) => Some((e.key, e.value)),
            _ => None,
        })
    }

    /// Delete every entry whose key fails the predicate. Part of the weak
    /// intern protocol: between mark and sweep the heap drops intern
    /// entries whose strings are unmarked.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(Value) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Full(e) = entry {
                if !keep(e.key) {
                    *entry = Entry::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    /// Specialized intern lookup: compares by length + hash + content
    /// rather than by key identity, since the point is to find an existing
    /// canonical string for freshly scanned bytes.
    pub fn find_string(&self, chars: &str, hash: u32, heap: &Heap) -> Option<ObjId> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            match &self.entries[index] {
                Entry::Vacant => return None,
                Entry::Tombstone => {}
                Entry::Full(entry) => {
                    if entry.hash == hash {
                        if let Value::Obj(id) = entry.key {
                            let data = heap.string_data(id);
                            if data.chars.len() == chars.len() && &*data.chars == chars {
                                return Some(id);
                            }
                        }
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Estimated footprint of the backing storage, for GC accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    /// Index of the full entry for `key`, or of the slot an insert should
    /// use: the first tombstone on the probe path if any, else the
    /// terminating vacant slot.
    fn find_slot(&self, key: Value, hash: u32) -> usize {
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Entry::Vacant => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full(entry) => {
                    if entry.key == key {
                        return index;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let capacity = std::cmp::max(8, self.entries.len() * 2);
        let old = std::mem::replace(&mut self.entries, vec![Entry::Vacant; capacity]);
        // Tombstones are dropped by the rebuild.
        self.count = self.live;
        for entry in old {
            if let Entry::Full(e) = entry {
                let index = self.rehash_slot(e.hash);
                self.entries[index] = Entry::Full(e);
            }
        }
    }

    /// Probe for the first vacant slot; used only while rebuilding, when no
    /// duplicate keys or tombstones exist.
    fn rehash_slot(&self, hash: u32) -> usize {
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        while matches!(self.entries[index], Entry::Full(_)) {
            index = (index + 1) % capacity;
        }
        index
    }
}
