//! Open-addressed hash table with Robin-Hood probing.
//!
//! Backs the string intern table, module value tables, globals, dict/set
//! entries, and class method tables.
//! Robin-Hood probing bounds the variance of probe lengths: on insert, an
//! entry that has already traveled farther from its ideal slot than the one
//! it collides with "steals" that slot, displacing the poorer (shorter
//! probe-length) entry to keep searching. On a tombstone-free table that
//! gives every `get` an early exit on an occupied slot — once its probe
//! length is shorter than the search's, the key cannot be present, because
//! Robin-Hood insertion would have placed it earlier.
//!
//! Deletion uses a tombstone (`key = empty, value = true`) rather than
//! backward-shift, so a `remove` during GC-triggered string-table cleanup
//! never has to rehash its neighbors. A tombstone carries no probe length,
//! so `find_slot` can't apply the early-exit check across one and instead
//! scans past it; once a table has had removals, a miss on a key whose ideal
//! slot sits before a run of tombstones degrades to a full scan of the probe
//! sequence, up to `probe_len > capacity`, rather than the bounded early
//! exit.

use crate::hash::TableHash;

#[derive(Clone)]
enum Slot<K, V> {
    Empty,
    Tombstone,
    Occupied { key: K, value: V, probe_len: u32 },
}

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone)]
pub struct Table<K, V> {
    slots: Vec<Slot<K, V>>,
    len: usize,
    tombstones: usize,
}

impl<K, V> Table<K, V>
where
    K: TableHash + PartialEq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Table {
            slots: Vec::new(),
            len: 0,
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn ensure_capacity(&mut self) {
        if self.slots.is_empty() {
            self.slots = vec![Slot::Empty; INITIAL_CAPACITY];
        } else if (self.len + self.tombstones + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM
        {
            self.grow();
        }
    }

    fn grow(&mut self) {
        let new_cap = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_cap]);
        self.len = 0;
        self.tombstones = 0;
        for slot in old {
            if let Slot::Occupied { key, value, .. } = slot {
                self.insert_no_grow(key, value);
            }
        }
    }

    /// Insert `key` -> `value`, returning the previous value if `key` was
    /// already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.ensure_capacity();
        self.insert_no_grow(key, value)
    }

    fn insert_no_grow(&mut self, mut key: K, mut value: V) -> Option<V> {
        let cap = self.slots.len();
        let mut index = (key.table_hash() as usize) % cap;
        let mut probe_len: u32 = 0;
        loop {
            match &mut self.slots[index] {
                Slot::Empty => {
                    self.slots[index] = Slot::Occupied {
                        key,
                        value,
                        probe_len,
                    };
                    self.len += 1;
                    return None;
                }
                Slot::Tombstone => {
                    self.slots[index] = Slot::Occupied {
                        key,
                        value,
                        probe_len,
                    };
                    self.len += 1;
                    self.tombstones -= 1;
                    return None;
                }
                Slot::Occupied {
                    key: ek,
                    value: ev,
                    probe_len: ep,
                } => {
                    if *ek == key {
                        return Some(std::mem::replace(ev, value));
                    }
                    if *ep < probe_len {
                        std::mem::swap(ek, &mut key);
                        std::mem::swap(ev, &mut value);
                        std::mem::swap(ep, &mut probe_len);
                    }
                }
            }
            index = (index + 1) % cap;
            probe_len += 1;
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let index = self.find_slot(key)?;
        match &self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find_slot(key)?;
        match &mut self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_slot(key).is_some()
    }

    fn find_slot(&self, key: &K) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.slots.len();
        let mut index = (key.table_hash() as usize) % cap;
        let mut probe_len: u32 = 0;
        loop {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied {
                    key: ek,
                    probe_len: ep,
                    ..
                } => {
                    if ek == key {
                        return Some(index);
                    }
                    // Robin-Hood invariant: probe lengths along the chain
                    // are non-decreasing from the key's ideal slot, so a
                    // shorter probe length here means our key was never
                    // inserted.
                    if *ep < probe_len {
                        return None;
                    }
                }
                Slot::Tombstone => {}
            }
            index = (index + 1) % cap;
            probe_len += 1;
            if probe_len as usize > cap {
                return None;
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.find_slot(key)?;
        match std::mem::replace(&mut self.slots[index], Slot::Tombstone) {
            Slot::Occupied { value, .. } => {
                self.len -= 1;
                self.tombstones += 1;
                Some(value)
            }
            _ => unreachable!(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { key, value, .. } => Some((key, value)),
            _ => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }
}

impl<K, V> Default for Table<K, V>
where
    K: TableHash + PartialEq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Heap;
    use crate::object::{Object, ObjString};
    use crate::value::Value;

    fn intern(heap: &mut Heap, s: &str) -> crate::handle::ObjHandle {
        heap.alloc(Object::String(ObjString::new(s.to_string())), 8 + s.len())
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let mut heap = Heap::new();
        let mut table: Table<crate::handle::ObjHandle, Value> = Table::new();
        let key_a = intern(&mut heap, "a");
        let key_b = intern(&mut heap, "b");

        assert_eq!(table.insert(key_a, Value::number(1.0)), None);
        assert_eq!(table.insert(key_b, Value::number(2.0)), None);
        assert_eq!(table.get(&key_a).unwrap().as_number(), 1.0);
        assert_eq!(table.insert(key_a, Value::number(9.0)), Some(Value::number(1.0)));
        assert_eq!(table.get(&key_a).unwrap().as_number(), 9.0);

        assert_eq!(table.remove(&key_b).unwrap().as_number(), 2.0);
        assert!(table.get(&key_b).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_past_load_factor_and_keeps_all_entries() {
        let mut heap = Heap::new();
        let mut table: Table<crate::handle::ObjHandle, Value> = Table::new();
        let mut keys = Vec::new();
        for i in 0..200 {
            let key = intern(&mut heap, &format!("key{i}"));
            table.insert(key, Value::number(i as f64));
            keys.push(key);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(key).unwrap().as_number(), i as f64);
        }
        assert_eq!(table.len(), 200);
    }

    #[test]
    fn remove_then_reinsert_reuses_tombstone() {
        let mut heap = Heap::new();
        let mut table: Table<crate::handle::ObjHandle, Value> = Table::new();
        let key = intern(&mut heap, "only");
        table.insert(key, Value::bool(true));
        table.remove(&key);
        assert!(!table.contains_key(&key));
        table.insert(key, Value::bool(false));
        assert_eq!(table.get(&key).unwrap().as_bool(), false);
    }
}
