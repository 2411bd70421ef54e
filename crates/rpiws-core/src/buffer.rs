//! Write-then-drain map used to batch value updates into one frame.
//!
//! Every hop of the streaming path owns one of these. Producers `insert`
//! freely; only keys whose value actually changed become dirty, and
//! `drain` hands back exactly the dirty entries while remembering the
//! last known value of every key. An unchanged source therefore drains
//! to nothing, which is what suppresses idle frames.

use indexmap::{IndexMap, IndexSet};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct DeltaBuffer<K, V> {
    values: IndexMap<K, V>,
    dirty: IndexSet<K>,
}

impl<K, V> Default for DeltaBuffer<K, V> {
    fn default() -> Self {
        Self {
            values: IndexMap::new(),
            dirty: IndexSet::new(),
        }
    }
}

impl<K, V> DeltaBuffer<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` under `key`. Returns true when the entry became dirty.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        match self.values.get_mut(&key) {
            Some(current) if *current == value => false,
            Some(current) => {
                *current = value;
                self.dirty.insert(key);
                true
            }
            None => {
                self.values.insert(key.clone(), value);
                self.dirty.insert(key);
                true
            }
        }
    }

    /// Copies every entry of `source`, marking only the changed ones dirty.
    pub fn merge_from(&mut self, source: &IndexMap<K, V>) {
        for (key, value) in source {
            self.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Number of pending (dirty) entries.
    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Last known value of every key ever written, dirty or not.
    pub fn snapshot(&self) -> &IndexMap<K, V> {
        &self.values
    }

    /// Returns the dirty entries in write order and empties the dirty set.
    pub fn drain(&mut self) -> IndexMap<K, V> {
        let mut out = IndexMap::with_capacity(self.dirty.len());
        for key in self.dirty.drain(..) {
            if let Some(value) = self.values.get(&key) {
                out.insert(key, value.clone());
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn drain_returns_dirty_entries_once() {
        let mut buffer: DeltaBuffer<String, Value> = DeltaBuffer::new();
        assert!(buffer.insert("a".to_string(), json!(1)));
        assert!(buffer.insert("b".to_string(), json!(true)));
        assert_eq!(buffer.len(), 2);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained.get("a"), Some(&json!(1)));
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
        assert_eq!(buffer.snapshot().len(), 2);
    }

    #[test]
    fn unchanged_value_is_not_dirty() {
        let mut buffer: DeltaBuffer<String, Value> = DeltaBuffer::new();
        buffer.insert("a".to_string(), json!(5));
        buffer.drain();

        assert!(!buffer.insert("a".to_string(), json!(5)));
        assert!(buffer.is_empty());

        assert!(buffer.insert("a".to_string(), json!(6)));
        assert_eq!(buffer.drain().get("a"), Some(&json!(6)));
    }

    #[test]
    fn rewrite_before_drain_keeps_latest_value_and_first_position() {
        let mut buffer: DeltaBuffer<String, Value> = DeltaBuffer::new();
        buffer.insert("a".to_string(), json!(1));
        buffer.insert("b".to_string(), json!(2));
        buffer.insert("a".to_string(), json!(3));

        let drained = buffer.drain();
        let keys: Vec<_> = drained.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(drained.get("a"), Some(&json!(3)));
    }

    #[test]
    fn merge_from_only_marks_changes() {
        let mut source: IndexMap<String, Value> = IndexMap::new();
        source.insert("x".to_string(), json!(1.5));
        source.insert("y".to_string(), Value::Null);

        let mut mirror: DeltaBuffer<String, Value> = DeltaBuffer::new();
        mirror.merge_from(&source);
        assert_eq!(mirror.drain().len(), 2);

        mirror.merge_from(&source);
        assert!(mirror.is_empty());

        source.insert("y".to_string(), json!(0));
        mirror.merge_from(&source);
        let drained = mirror.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.get("y"), Some(&json!(0)));
    }
}
