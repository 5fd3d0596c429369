//! Keyed, sortable containers of models.
//!
//! [`KeyedMap`] is the ordered map every registry and relation uses.
//! [`ModelCollection`] adds an optional comparator on top of it.
//! [`FilteredCollection`] and [`RemoteQuery`] are live views owned by a
//! [`Database`](crate::Database).

mod filtered;
mod query;

pub use filtered::{CollectionEvent, FilteredCollection};
pub use query::{QueryEvent, QueryStatus, RemoteQuery};

use crate::compare::Comparator;
use crate::{Key, Model};
use std::cmp::Ordering;
use std::collections::HashMap;

/// An insertion-ordered map with O(1) lookup and swap removal.
///
/// Removing a key moves the last entry into the vacated slot, so order is
/// only meaningful after a [`sort_by`](KeyedMap::sort_by).
#[derive(Debug, Clone)]
pub struct KeyedMap<V> {
    keys: Vec<Key>,
    values: Vec<V>,
    indices: HashMap<Key, usize>,
}

impl<V> Default for KeyedMap<V> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            indices: HashMap::new(),
        }
    }
}

impl<V> KeyedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the previous value for `key`.
    pub fn put(&mut self, key: Key, value: V) -> Option<V> {
        match self.indices.get(&key) {
            Some(&index) => Some(std::mem::replace(&mut self.values[index], value)),
            None => {
                self.indices.insert(key.clone(), self.values.len());
                self.keys.push(key);
                self.values.push(value);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.indices.get(key).map(|&index| &self.values[index])
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        match self.indices.get(key) {
            Some(&index) => Some(&mut self.values[index]),
            None => None,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.indices.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let index = self.indices.remove(key)?;
        let last = self.values.len() - 1;
        if index != last {
            self.keys.swap(index, last);
            self.values.swap(index, last);
            self.indices.insert(self.keys[index].clone(), index);
        }
        self.keys.pop();
        self.values.pop()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> {
        self.keys.iter().zip(self.values.iter())
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.indices.clear();
    }

    /// Stable sort of the entries by value.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&V, &V) -> Ordering,
    {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.sort_by(|&a, &b| compare(&self.values[a], &self.values[b]));

        let mut keys: Vec<Option<Key>> = self.keys.drain(..).map(Some).collect();
        let mut values: Vec<Option<V>> = self.values.drain(..).map(Some).collect();
        for (position, index) in order.into_iter().enumerate() {
            if let (Some(key), Some(value)) = (keys[index].take(), values[index].take()) {
                self.indices.insert(key.clone(), position);
                self.keys.push(key);
                self.values.push(value);
            }
        }
    }
}

/// A keyed set of models with an optional sort order.
#[derive(Clone, Default)]
pub struct ModelCollection {
    models: KeyedMap<Model>,
    comparator: Option<Comparator>,
}

impl std::fmt::Debug for ModelCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCollection")
            .field("keys", &self.models.keys())
            .field("sorted", &self.comparator.is_some())
            .finish()
    }
}

impl ModelCollection {
    pub fn new(comparator: Option<Comparator>) -> Self {
        Self {
            models: KeyedMap::new(),
            comparator,
        }
    }

    /// Insert under the model's own key.
    pub fn put(&mut self, model: Model) -> Option<Model> {
        let key = model.key();
        self.put_with_key(key, model)
    }

    pub fn put_with_key(&mut self, key: Key, model: Model) -> Option<Model> {
        self.models.put(key, model)
    }

    pub fn get(&self, key: &str) -> Option<&Model> {
        self.models.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.models.has(key)
    }

    /// Whether this exact model instance is present under `key`.
    pub fn contains(&self, key: &str, model: &Model) -> bool {
        self.models.get(key).is_some_and(|m| m.ptr_eq(model))
    }

    pub fn remove(&mut self, key: &str) -> Option<Model> {
        self.models.remove(key)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn keys(&self) -> &[Key] {
        self.models.keys()
    }

    pub fn models(&self) -> &[Model] {
        self.models.values()
    }

    pub fn to_vec(&self) -> Vec<Model> {
        self.models.values().to_vec()
    }

    pub fn clear(&mut self) {
        self.models.clear();
    }

    pub fn comparator(&self) -> Option<&Comparator> {
        self.comparator.as_ref()
    }

    pub fn set_comparator(&mut self, comparator: Option<Comparator>) {
        self.comparator = comparator;
        self.sort();
    }

    /// Reorder by the comparator. A no-op without one.
    pub fn sort(&mut self) {
        if let Some(comparator) = self.comparator.clone() {
            self.models.sort_by(|a, b| comparator(a, b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn filled() -> KeyedMap<u32> {
        let mut map = KeyedMap::new();
        map.put("a".into(), 3);
        map.put("b".into(), 1);
        map.put("c".into(), 2);
        map
    }

    #[test]
    fn put_replaces_in_place() {
        let mut map = filled();
        assert_eq!(map.put("b".into(), 10), Some(1));
        assert_eq!(map.values(), &[3, 10, 2]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn remove_swaps_last_into_slot() {
        let mut map = filled();
        assert_eq!(map.remove("a"), Some(3));
        assert_eq!(map.keys(), &["c".to_string(), "b".to_string()]);
        assert_eq!(map.get("c"), Some(&2));
        assert_eq!(map.remove("a"), None);

        assert_eq!(map.remove("b"), Some(1));
        assert_eq!(map.remove("c"), Some(2));
        assert!(map.is_empty());
    }

    #[test]
    fn sort_keeps_index_consistent() {
        let mut map = filled();
        map.sort_by(|a, b| a.cmp(b));
        assert_eq!(map.values(), &[1, 2, 3]);
        assert_eq!(map.keys(), &["b".to_string(), "c".to_string(), "a".to_string()]);
        assert_eq!(map.get("a"), Some(&3));

        *map.get_mut("c").unwrap() = 7;
        assert_eq!(map.remove("b"), Some(1));
        assert_eq!(map.get("c"), Some(&7));
        assert_eq!(map.get("a"), Some(&3));
    }

    proptest! {
        #[test]
        fn behaves_like_a_map(ops in prop::collection::vec((any::<bool>(), 0u8..8, any::<u32>()), 0..64)) {
            let mut map = KeyedMap::new();
            let mut model = BTreeMap::new();
            for (insert, key, value) in ops {
                let key = key.to_string();
                if insert {
                    prop_assert_eq!(map.put(key.clone(), value), model.insert(key, value));
                } else {
                    prop_assert_eq!(map.remove(&key), model.remove(&key));
                }
            }
            map.sort_by(|a, b| a.cmp(b));

            prop_assert_eq!(map.len(), model.len());
            for (key, value) in &model {
                prop_assert_eq!(map.get(key), Some(value));
            }
            prop_assert!(map.values().windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
