//! Open-addressing hash table, keyed on interned strings.
//!
//! Linear probing with tombstones, power-of-two capacity, grown at a 0.75
//! load factor. Used for globals, instance fields, class method tables, and
//! the heap's string intern set — the last of which is why `find_string`
//! exists as a byte-comparison lookup rather than going through `ObjString`
//! pointer identity.
//!
//! Keys are raw `NonNull<ObjString>` rather than owned strings: the table
//! never owns the strings it indexes by, the heap does, and keeping them
//! reachable for as long as the table references them is the heap's job via
//! the mark phase walking every table the VM holds live.

use crate::obj_string::ObjString;
use crate::value::Value;
use std::ptr::NonNull;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<NonNull<ObjString>>,
    value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry {
            key: None,
            value: Value::nil(),
        }
    }

    /// A tombstone is a deleted slot: key is `None` but the slot holds a
    /// non-nil sentinel, so probing knows to keep scanning past it instead
    /// of treating the walk as having found an empty slot.
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value != Value::nil()
    }
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: NonNull<ObjString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.entries, key)?;
        self.entries[idx].key?;
        Some(self.entries[idx].value)
    }

    /// Inserts or overwrites. Returns `true` iff `key` was not already
    /// present — callers (global variable assignment) use this to
    /// distinguish "new binding" from "reassignment".
    pub fn set(&mut self, key: NonNull<ObjString>, value: Value) -> bool {
        if self.needs_growth() {
            self.grow();
        }
        let idx = Self::find_slot(&self.entries, key)
            .expect("table has free capacity after growth check");
        let is_new_key = self.entries[idx].key.is_none();
        // Only a genuinely empty slot (not a tombstone) grows the count:
        // reusing a tombstone keeps the load factor accounting honest.
        if is_new_key && !self.entries[idx].is_tombstone() {
            self.count += 1;
        }
        self.entries[idx] = Entry {
            key: Some(key),
            value,
        };
        is_new_key
    }

    pub fn delete(&mut self, key: NonNull<ObjString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let Some(idx) = Self::find_slot(&self.entries, key) else {
            return false;
        };
        if self.entries[idx].key.is_none() {
            return false;
        }
        // Tombstone: a sentinel entry with a non-nil value so probes keep
        // walking past it. Count is left alone; it only tracks live entries
        // plus tombstones for load-factor purposes, matching clox.
        self.entries[idx] = Entry {
            key: None,
            value: Value::bool(true),
        };
        true
    }

    /// Copy every live entry of `other` into `self`. Used for single
    /// inheritance: copying a superclass's method table into the subclass
    /// at class-definition time instead of chain-walking at call time.
    pub fn add_all_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// Iterate over every live (non-tombstone) entry. Used by the collector
    /// to mark every key and value a table holds live, and by the weak-ref
    /// sweep over the string intern table.
    pub fn iter(&self) -> impl Iterator<Item = (NonNull<ObjString>, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Byte-compare lookup used only by the intern table: find an existing
    /// `ObjString` with these exact bytes and hash, without allocating a
    /// candidate `ObjString` first.
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<NonNull<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut idx = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) => {
                    let s = unsafe { key.as_ref() };
                    if s.hash == hash && s.as_bytes() == bytes {
                        return Some(key);
                    }
                }
                None => {}
            }
            idx = (idx + 1) & (capacity - 1);
        }
    }

    fn needs_growth(&self) -> bool {
        self.entries.is_empty() || (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut live = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let idx = Self::find_slot(&new_entries, key)
                    .expect("fresh table with load factor headroom always has a free slot");
                new_entries[idx] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                live += 1;
            }
        }
        self.entries = new_entries;
        // Tombstones are dropped on growth; only live entries survive.
        self.count = live;
    }

    fn find_slot(entries: &[Entry], key: NonNull<ObjString>) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        let capacity = entries.len();
        let hash = unsafe { key.as_ref() }.hash;
        let mut idx = (hash as usize) & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[idx];
            match entry.key {
                Some(k) if k == key => return Some(idx),
                Some(_) => {}
                None if entry.is_tombstone() => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                None => return Some(first_tombstone.unwrap_or(idx)),
            }
            idx = (idx + 1) & (capacity - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_string(bytes: &[u8]) -> NonNull<ObjString> {
        let boxed = Box::new(ObjString::new(Box::from(bytes)));
        NonNull::from(Box::leak(boxed))
    }

    #[test]
    fn set_returns_true_only_for_new_keys() {
        let mut table = Table::new();
        let key = leak_string(b"foo");
        assert!(table.set(key, Value::number(1.0)));
        assert!(!table.set(key, Value::number(2.0)));
        assert_eq!(table.get(key).unwrap().as_number(), 2.0);
    }

    #[test]
    fn delete_then_get_misses_but_count_semantics_hold() {
        let mut table = Table::new();
        let key = leak_string(b"bar");
        table.set(key, Value::number(1.0));
        assert!(table.delete(key));
        assert!(table.get(key).is_none());
        assert!(!table.delete(key));
    }

    #[test]
    fn grows_and_preserves_entries() {
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..64 {
            let key = leak_string(format!("k{i}").as_bytes());
            table.set(key, Value::number(i as f64));
            keys.push(key);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key).unwrap().as_number(), i as f64);
        }
    }

    #[test]
    fn find_string_matches_by_bytes_not_pointer() {
        let mut table = Table::new();
        let key = leak_string(b"shared");
        table.set(key, Value::nil());
        let hash = crate::obj_string::fnv1a_hash(b"shared");
        assert_eq!(table.find_string(b"shared", hash), Some(key));
        assert_eq!(table.find_string(b"other", hash), None);
    }
}
