//! The open-addressing hash table backing every plain object.
//!
//! Keys are arbitrary byte strings (not necessarily UTF-8) compared for exact
//! equality. Setting a key to `NULL` deletes it; deleted slots become
//! tombstones that are only reclaimed on the next rehash, matching the
//! "grow drops tombstones" contract in the spec.

use xxhash_rust::xxh3::xxh3_64;

use crate::value::Value;

const INITIAL_CAPACITY: usize = 4;

struct Entry {
    key: Box<[u8]>,
    value: Value,
    deleted: bool,
}

/// The result of a lookup probe: either a live match, a free slot to insert
/// into, or (if every slot was a tombstone/full) `None`.
enum Probe {
    Found(usize),
    Insert(usize),
    Full,
}

#[derive(Default)]
pub struct Table {
    entries: Vec<Option<Entry>>,
    len: usize,
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity_hint(n: usize) -> Self {
        let mut table = Self::new();
        if n > 0 {
            table.grow_to(capacity_for(n));
        }
        table
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn hash(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    fn probe(&self, key: &[u8]) -> Probe {
        let cap = self.entries.len();
        if cap == 0 {
            return Probe::Full;
        }
        let start = (Self::hash(key) as usize) % cap;
        let mut first_tombstone: Option<usize> = None;

        for step in 0..cap {
            let idx = (start + step) % cap;
            match &self.entries[idx] {
                None => {
                    return Probe::Insert(first_tombstone.unwrap_or(idx));
                }
                Some(entry) if entry.deleted => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Some(entry) if !entry.deleted && entry.key.as_ref() == key => {
                    return Probe::Found(idx);
                }
                Some(_) => {}
            }
        }

        match first_tombstone {
            Some(idx) => Probe::Insert(idx),
            None => Probe::Full,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self.probe(key) {
            Probe::Found(idx) => self.entries[idx].as_ref().map(|e| &e.value),
            _ => None,
        }
    }

    /// Sets `key` to `value`. Setting `Value::Null` deletes the entry.
    /// Returns `true` if an existing live key was removed or replaced.
    pub fn set(&mut self, key: &[u8], value: Value) {
        if matches!(value, Value::Null) {
            self.delete(key);
            return;
        }

        if self.needs_growth() {
            self.grow_to(capacity_for(self.len + 1));
        }

        match self.probe(key) {
            Probe::Found(idx) => {
                if let Some(entry) = &mut self.entries[idx] {
                    entry.value = value;
                }
            }
            Probe::Insert(idx) => {
                self.entries[idx] = Some(Entry {
                    key: key.to_vec().into_boxed_slice(),
                    value,
                    deleted: false,
                });
                self.len += 1;
            }
            Probe::Full => {
                self.grow_to(capacity_for(self.len + 1));
                self.set(key, value);
            }
        }
    }

    pub fn delete(&mut self, key: &[u8]) {
        if let Probe::Found(idx) = self.probe(key) {
            if let Some(entry) = &mut self.entries[idx] {
                entry.deleted = true;
                entry.value = Value::Null;
            }
            self.len -= 1;
        }
    }

    fn needs_growth(&self) -> bool {
        let cap = self.entries.len();
        if cap == 0 {
            return true;
        }
        // Grow at 2/3 load factor, counting live entries only (tombstones
        // don't count against the host but do consume probe-sequence space,
        // which `grow_to` reclaims).
        (self.len + 1) * 3 >= cap * 2
    }

    fn grow_to(&mut self, new_cap: usize) {
        let new_cap = new_cap.max(INITIAL_CAPACITY).max(self.entries.len() * 2 + 1);
        let old_entries = std::mem::replace(&mut self.entries, (0..new_cap).map(|_| None).collect());
        self.len = 0;
        for entry in old_entries.into_iter().flatten() {
            if !entry.deleted {
                self.reinsert(entry.key, entry.value);
            }
        }
    }

    fn reinsert(&mut self, key: Box<[u8]>, value: Value) {
        if let Probe::Insert(idx) = self.probe(&key) {
            self.entries[idx] = Some(Entry {
                key,
                value,
                deleted: false,
            });
            self.len += 1;
        }
    }

    /// Returns `true` iff this object is an "array of length N": entries
    /// exist for every decimal key `"0"..(N-1)"` and nothing else beyond
    /// that, with exactly N live entries.
    pub fn array_len(&self) -> Option<usize> {
        if self.len == 0 {
            return Some(0);
        }
        for i in 0..self.len {
            let key = i.to_string();
            if self.get(key.as_bytes()).is_none() {
                return None;
            }
        }
        Some(self.len)
    }

    pub fn append(&mut self, value: Value) {
        let key = self.len.to_string();
        self.set(key.as_bytes(), value);
    }

    /// Iterates every live entry. Order is unspecified but stable across
    /// calls for an un-mutated table, matching the spec's iteration cursor.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().filter_map(|slot| {
            slot.as_ref()
                .filter(|e| !e.deleted)
                .map(|e| (e.key.as_ref(), &e.value))
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.iter().map(|(_, v)| v)
    }
}

fn capacity_for(min_live: usize) -> usize {
    let mut cap = INITIAL_CAPACITY;
    while (min_live * 3) >= (cap * 2) {
        cap = cap * 2 + 1;
    }
    cap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let mut t = Table::new();
        t.set(b"a", Value::from_bool(true));
        assert!(t.get(b"a").is_some());
        t.set(b"a", Value::Null);
        assert!(t.get(b"a").is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn delete_then_reinsert_matches_single_insert() {
        let mut fresh = Table::new();
        fresh.set(b"k", Value::from_bool(true));

        let mut reused = Table::new();
        reused.set(b"k", Value::from_bool(true));
        reused.set(b"k", Value::Null);
        reused.set(b"k", Value::from_bool(true));

        assert_eq!(fresh.len(), reused.len());
        assert!(reused.get(b"k").is_some());
    }

    #[test]
    fn grows_and_keeps_all_live_keys() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(i.to_string().as_bytes(), Value::from_bool(true));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert!(t.get(i.to_string().as_bytes()).is_some());
        }
    }

    #[test]
    fn array_view() {
        let mut t = Table::new();
        t.append(Value::from_bool(true));
        t.append(Value::from_bool(true));
        t.append(Value::from_bool(true));
        assert_eq!(t.array_len(), Some(3));
        t.set(b"x", Value::from_bool(true));
        assert_eq!(t.array_len(), None);
    }
}
