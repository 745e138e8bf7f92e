//! An open-addressing hash table keyed by interned strings.
//!
//! Used for globals, object fields, method tables and the string-intern pool. Keys carry their
//! precomputed hash, so the table never needs to look inside the heap.

use crate::object::ObjRef;
use crate::value::Value;

/// The table grows before `count / capacity` would exceed this.
const MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

/// An interned string, used as a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub string: ObjRef,
    pub hash: u32,
}

/// A hash table from interned strings to values.
#[derive(Debug, Default, Clone)]
pub struct Table {
    /// Occupied slots, tombstones included.
    count: usize,
    /// Occupied slots, tombstones excluded.
    live: usize,
    entries: Vec<Entry>,
}

/// A slot. With no key, `Null` marks a never-used slot and anything else is a tombstone.
#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<Key>,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Null,
};

const TOMBSTONE: Entry = Entry {
    key: None,
    value: Value::Bool(true),
};

/// 32-bit FNV-1a.
///
/// ```
/// assert_eq!(0x811c9dc5, joker::table::hash_string(""));
/// assert_eq!(0xe40c292c, joker::table::hash_string("a"));
/// ```
pub fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in s.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// How many keys are present.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// How many slots have been allocated.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_entry(key)];
        entry.key.map(|_| entry.value)
    }

    pub fn contains_key(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or overwrites a key. Returns true if the key was not present before.
    pub fn set(&mut self, key: Key, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow();
        }

        let index = self.find_entry(key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new {
            self.live += 1;
            // Reusing a tombstone does not change the count.
            if entry.value.is_null() {
                self.count += 1;
            }
        }

        *entry = Entry {
            key: Some(key),
            value,
        };
        is_new
    }

    /// Removes a key, leaving a tombstone. Returns true if the key was present.
    pub fn delete(&mut self, key: Key) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = self.find_entry(key);
        if self.entries[index].key.is_none() {
            return false;
        }

        self.entries[index] = TOMBSTONE;
        self.live -= 1;
        true
    }

    /// Copies every entry of `self` into `to`, overwriting keys that already exist there.
    pub fn add_all(&self, to: &mut Table) {
        for (key, value) in self.iter() {
            to.set(key, value);
        }
    }

    /// Looks up a key by content instead of by handle. `matches` is asked about every candidate
    /// with the right hash. This is how the intern pool finds an existing string.
    pub fn find_string(&self, hash: u32, mut matches: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }

        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if entry.value.is_null() => return None,
                Some(key) if key.hash == hash && matches(key.string) => return Some(key.string),
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Deletes every key whose string is not marked. The intern pool is a weak set; this runs
    /// between marking and sweeping.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !is_marked(key.string) {
                    *entry = TOMBSTONE;
                    self.live -= 1;
                }
            }
        }
    }

    /// Iterates over every present key and its value, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Calls `visit` with every key and every value.
    pub fn for_each_reference(&self, mut visit: impl FnMut(Value)) {
        for (key, value) in self.iter() {
            visit(key.string.into());
            visit(value);
        }
    }

    /// Finds the slot for `key`: either the slot holding it, or the slot it should go in. The
    /// first tombstone passed is preferred over an empty slot.
    fn find_entry(&self, key: Key) -> usize {
        debug_assert!(self.capacity().is_power_of_two());
        let mask = self.capacity() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone = None;

        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(k) if k.string == key.string => return index,
                Some(_) => {}
                None if entry.value.is_null() => return tombstone.unwrap_or(index),
                None => {
                    tombstone.get_or_insert(index);
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Doubles the capacity and rehashes. Tombstones are dropped along the way.
    fn grow(&mut self) {
        let capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);

        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = self.find_entry(key);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
        self.live = self.count;
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    /// Keys with a tiny hash space, so probing and tombstones get a workout.
    fn key(n: u8) -> Key {
        Key {
            string: ObjRef::from_index(n as usize),
            hash: (n % 4) as u32,
        }
    }

    fn load_is_bounded(table: &Table) -> bool {
        table.count as f64 <= table.capacity() as f64 * MAX_LOAD
    }

    #[test]
    fn empty_table() {
        let table = Table::new();
        assert_eq!(None, table.get(key(1)));
        assert!(table.is_empty());
        assert_eq!(0, table.capacity());
    }

    #[test]
    fn set_reports_new_keys() {
        let mut table = Table::new();
        assert!(table.set(key(1), Value::I32(1)));
        assert!(!table.set(key(1), Value::I32(2)));
        assert_eq!(Some(Value::I32(2)), table.get(key(1)));
        assert_eq!(1, table.len());
    }

    #[test]
    fn deleted_then_reinserted_key_is_found() {
        let mut table = Table::new();
        table.set(key(0), Value::I32(0));
        table.set(key(4), Value::I32(4));
        table.set(key(8), Value::I32(8));

        assert!(table.delete(key(4)));
        assert!(!table.delete(key(4)));
        // key(8) sits behind the tombstone in the probe sequence.
        assert_eq!(Some(Value::I32(8)), table.get(key(8)));

        assert!(table.set(key(4), Value::Bool(false)));
        assert_eq!(Some(Value::Bool(false)), table.get(key(4)));
        assert_eq!(3, table.len());
    }

    #[test]
    fn deleting_keeps_the_slot_count() {
        let mut table = Table::new();
        table.set(key(1), Value::None);
        let count = table.count;
        table.delete(key(1));
        assert_eq!(count, table.count);
        assert_eq!(0, table.len());
    }

    #[test]
    fn find_string_uses_the_matcher() {
        let mut table = Table::new();
        table.set(key(1), Value::None);
        table.set(key(5), Value::None);

        assert_eq!(
            Some(ObjRef::from_index(5)),
            table.find_string(1, |s| s.index() == 5)
        );
        assert_eq!(None, table.find_string(1, |s| s.index() == 9));
        assert_eq!(None, table.find_string(2, |_| true));
    }

    #[test]
    fn remove_unmarked_drops_only_white_keys() {
        let mut table = Table::new();
        for n in 0..10 {
            table.set(key(n), Value::I32(n as i32));
        }
        table.remove_unmarked(|s| s.index() % 2 == 0);
        assert_eq!(5, table.len());
        assert!(table.contains_key(key(2)));
        assert!(!table.contains_key(key(3)));
    }

    #[test]
    fn add_all_copies_every_entry() {
        let mut from = Table::new();
        from.set(key(1), Value::I32(1));
        from.set(key(2), Value::I32(2));
        let mut to = Table::new();
        to.set(key(2), Value::I32(0));

        from.add_all(&mut to);
        assert_eq!(2, to.len());
        assert_eq!(Some(Value::I32(2)), to.get(key(2)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, i32),
        Delete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..32, any::<i32>()).prop_map(|(k, v)| Op::Set(k, v)),
            (0u8..32).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_hash_map(ops in proptest::collection::vec(op(), 0..200)) {
            let mut table = Table::new();
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        let is_new = table.set(key(k), Value::I32(v));
                        prop_assert_eq!(model.insert(k, v).is_none(), is_new);
                    }
                    Op::Delete(k) => {
                        prop_assert_eq!(model.remove(&k).is_some(), table.delete(key(k)));
                    }
                }
                prop_assert!(load_is_bounded(&table));
            }

            prop_assert_eq!(model.len(), table.len());
            for k in 0u8..32 {
                prop_assert_eq!(model.get(&k).map(|&v| Value::I32(v)), table.get(key(k)));
            }
        }
    }
}
