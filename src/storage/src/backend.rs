// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use bytes::Bytes;
use spacker_common::hash::KeyGroup;

/// One `(namespace, user key) -> value` triple inside a key group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEntry {
    pub namespace: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// The capability set the migration protocol needs from a state backend.
///
/// Any backend variant (heap, file, LSM) that can address state by key group
/// and enumerate a group's entries in a deterministic order can participate in
/// migration; nothing else about its layout is assumed.
pub trait StateBackend: Send + 'static {
    fn get(&self, kg: KeyGroup, namespace: &[u8], key: &[u8]) -> Option<Bytes>;

    fn put(&mut self, kg: KeyGroup, namespace: Bytes, key: Bytes, value: Bytes);

    fn remove(&mut self, kg: KeyGroup, namespace: &[u8], key: &[u8]) -> Option<Bytes>;

    /// Entries of one key group in a deterministic iteration order.
    fn iter_key_group(&self, kg: KeyGroup) -> Box<dyn Iterator<Item = StateEntry> + '_>;

    /// Drop every entry of the given key group, returning whether any existed.
    fn drop_key_group(&mut self, kg: KeyGroup) -> bool;

    fn is_empty_key_group(&self, kg: KeyGroup) -> bool;
}

type NamespaceMap = BTreeMap<Bytes, BTreeMap<Bytes, Bytes>>;

/// In-memory backend: an array indexed by key group of namespace maps. Unused
/// slots stay unallocated.
pub struct HeapStateBackend {
    groups: Vec<Option<NamespaceMap>>,
}

impl HeapStateBackend {
    pub fn new(max_parallelism: u32) -> Self {
        Self {
            groups: (0..max_parallelism).map(|_| None).collect(),
        }
    }

    fn group(&self, kg: KeyGroup) -> Option<&NamespaceMap> {
        self.groups[kg.as_u32() as usize].as_ref()
    }

    fn group_mut(&mut self, kg: KeyGroup) -> &mut NamespaceMap {
        self.groups[kg.as_u32() as usize].get_or_insert_with(BTreeMap::new)
    }
}

impl StateBackend for HeapStateBackend {
    fn get(&self, kg: KeyGroup, namespace: &[u8], key: &[u8]) -> Option<Bytes> {
        self.group(kg)?.get(namespace)?.get(key).cloned()
    }

    fn put(&mut self, kg: KeyGroup, namespace: Bytes, key: Bytes, value: Bytes) {
        self.group_mut(kg)
            .entry(namespace)
            .or_default()
            .insert(key, value);
    }

    fn remove(&mut self, kg: KeyGroup, namespace: &[u8], key: &[u8]) -> Option<Bytes> {
        let ns_map = self.groups[kg.as_u32() as usize].as_mut()?;
        let key_map = ns_map.get_mut(namespace)?;
        let removed = key_map.remove(key);
        if key_map.is_empty() {
            ns_map.remove(namespace);
        }
        removed
    }

    fn iter_key_group(&self, kg: KeyGroup) -> Box<dyn Iterator<Item = StateEntry> + '_> {
        match self.group(kg) {
            None => Box::new(std::iter::empty()),
            Some(ns_map) => Box::new(ns_map.iter().flat_map(|(ns, key_map)| {
                key_map.iter().map(move |(key, value)| StateEntry {
                    namespace: ns.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
            })),
        }
    }

    fn drop_key_group(&mut self, kg: KeyGroup) -> bool {
        self.groups[kg.as_u32() as usize].take().is_some()
    }

    fn is_empty_key_group(&self, kg: KeyGroup) -> bool {
        self.group(kg).map_or(true, |ns_map| ns_map.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn kg(id: u32) -> KeyGroup {
        KeyGroup::new(id)
    }

    #[test]
    fn test_heap_backend_round_trip() {
        let mut backend = HeapStateBackend::new(4);
        backend.put(kg(1), Bytes::from("ns"), Bytes::from("a"), Bytes::from("1"));
        backend.put(kg(1), Bytes::from("ns"), Bytes::from("b"), Bytes::from("2"));
        backend.put(kg(2), Bytes::from("ns"), Bytes::from("a"), Bytes::from("3"));

        assert_eq!(backend.get(kg(1), b"ns", b"a"), Some(Bytes::from("1")));
        assert_eq!(backend.get(kg(2), b"ns", b"b"), None);
        assert!(backend.is_empty_key_group(kg(0)));

        let entries = backend.iter_key_group(kg(1)).collect_vec();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, Bytes::from("a"));

        assert_eq!(backend.remove(kg(1), b"ns", b"a"), Some(Bytes::from("1")));
        assert_eq!(backend.remove(kg(1), b"ns", b"a"), None);

        assert!(backend.drop_key_group(kg(2)));
        assert!(backend.is_empty_key_group(kg(2)));
        assert!(!backend.drop_key_group(kg(2)));
    }

    #[test]
    fn test_iteration_order_is_deterministic() {
        let mut backend = HeapStateBackend::new(2);
        for key in ["z", "a", "m"] {
            backend.put(
                kg(0),
                Bytes::from("ns"),
                Bytes::from(key),
                Bytes::from("v"),
            );
        }
        let keys = backend
            .iter_key_group(kg(0))
            .map(|e| e.key)
            .collect_vec();
        assert_eq!(keys, vec!["a", "m", "z"]);
    }
}
