//! String interning (data model invariant 1): `copy_string` and `take_string`
//! are the sole constructors for heap strings, and both route through this
//! table so that two equal byte sequences always resolve to the same
//! [`ObjHandle`].

use crate::handle::{Heap, ObjHandle};
use crate::hash::TableHash;
use crate::object::{Object, ObjString, fnv1a_hash};
use crate::table::Table;

#[derive(Clone, PartialEq, Eq)]
struct InternKey {
    hash: u32,
    bytes: Box<str>,
}

impl TableHash for InternKey {
    fn table_hash(&self) -> u64 {
        // The content hash IS the table hash; no further mixing needed since
        // FNV-1a already spreads bits well, and re-mixing would just cost
        // cycles on every probe.
        self.hash as u64
    }
}

#[derive(Default)]
pub struct Interner {
    table: Table<InternKey, ObjHandle>,
}

impl Interner {
    pub fn new() -> Self {
        Interner { table: Table::new() }
    }

    /// Return the interned handle for `s`, allocating a new `String` object
    /// only if no string with this content has been interned yet.
    pub fn intern(&mut self, heap: &mut Heap, s: &str) -> ObjHandle {
        let hash = fnv1a_hash(s.as_bytes());
        let key = InternKey {
            hash,
            bytes: s.into(),
        };
        if let Some(handle) = self.table.get(&key) {
            return *handle;
        }
        let handle = heap.alloc(Object::String(ObjString::new(s.to_string())), 24 + s.len());
        self.table.insert(key, handle);
        handle
    }

    /// Drop every interned entry whose string is no longer reachable
    /// elsewhere (collector step 3: these become unreachable via the string
    /// pool alone). `is_live` reports whether the heap still considers the
    /// handle reachable (i.e. marked dark) at the point this runs, which
    /// must be *after* the mark phase and *before* sweep.
    pub fn retain_live(&mut self, is_live: impl Fn(ObjHandle) -> bool) {
        let dead: Vec<InternKey> = self
            .table
            .iter()
            .filter(|(_, handle)| !is_live(**handle))
            .map(|(key, _)| key.clone())
            .collect();
        for key in dead {
            self.table.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_interns_to_the_same_handle() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, "hello");
        let b = interner.intern(&mut heap, "hel".to_string() + "lo");
        assert_eq!(a, b);
        assert_eq!(heap.live_count(), 1, "only one String object should exist");
    }

    #[test]
    fn distinct_content_interns_separately() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, "a");
        let b = interner.intern(&mut heap, "b");
        assert_ne!(a, b);
    }
}
