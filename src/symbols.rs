//! Symbol tables for modules, callsites and heap types
//!
//! Every table hands out small integer ids in first-seen order, starting at 0.
//! The decoder rebuilds the same numbering by counting definitions in the
//! log, so an id is only ever assigned once per recording session.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Result of a lookup-or-insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interned {
    /// Stable id of the key
    pub id: u32,
    /// True when the key was seen for the first time (a definition must be emitted)
    pub is_new: bool,
}

/// First-seen-order index over arbitrary keys
#[derive(Debug, Clone)]
pub struct SymbolTable<K> {
    index: HashMap<K, u32>,
}

impl<K> Default for SymbolTable<K> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> SymbolTable<K> {
    /// Return the id of `key`, assigning the next id if it is new
    ///
    /// The key is only cloned into the table on first sight, so repeated
    /// lookups on the hot path do not allocate.
    pub fn intern<Q>(&mut self, key: &Q) -> Interned
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(&id) = self.index.get(key) {
            return Interned { id, is_new: false };
        }
        let id = self.index.len() as u32;
        self.index.insert(key.to_owned(), id);
        Interned { id, is_new: true }
    }
}

/// The three tables a recording session maintains
///
/// A new session starts from `SymbolTables::default()`.
#[derive(Debug, Default, Clone)]
pub struct SymbolTables {
    /// Module name -> module id
    pub modules: SymbolTable<String>,
    /// (source module, target module) -> callsite id
    pub callsites: SymbolTable<(u32, u32)>,
    /// Heap type name -> type id
    pub types: SymbolTable<String>,
}
