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

use std::collections::HashSet;

use bytes::Bytes;
use spacker_common::hash::KeyGroup;
use tracing::trace;

use crate::backend::{HeapStateBackend, StateBackend, StateEntry};
use crate::error::{StorageError, StorageResult};
use crate::handle::{HandleWriter, KeyGroupStateHandle};

/// Per-operator keyed state, partitioned by key group.
///
/// The engine sets the current key context before invoking the operator for a
/// record; `get`/`put`/`remove` then address state under that context. Every
/// mutation records the touched key group in the changelog, which is what the
/// replicator and the affected-state snapshot consult to ship only what
/// changed since the last cycle.
pub struct StateTable<S: StateBackend = HeapStateBackend> {
    backend: S,
    max_parallelism: u32,

    /// Key groups written since the last replication or reconfig cycle.
    changelog: HashSet<KeyGroup>,

    current_key: Option<Bytes>,
    current_kg: Option<KeyGroup>,
}

impl StateTable<HeapStateBackend> {
    pub fn new_heap(max_parallelism: u32) -> Self {
        Self::with_backend(HeapStateBackend::new(max_parallelism), max_parallelism)
    }
}

impl<S: StateBackend> StateTable<S> {
    pub fn with_backend(backend: S, max_parallelism: u32) -> Self {
        Self {
            backend,
            max_parallelism,
            changelog: HashSet::new(),
            current_key: None,
            current_kg: None,
        }
    }

    pub fn max_parallelism(&self) -> u32 {
        self.max_parallelism
    }

    /// Set the key context for the record about to be processed.
    pub fn set_current_key(&mut self, key: &[u8]) {
        let kg = KeyGroup::from_key(key, self.max_parallelism);
        self.current_key = Some(Bytes::copy_from_slice(key));
        self.current_kg = Some(kg);
    }

    pub fn current_key_group(&self) -> Option<KeyGroup> {
        self.current_kg
    }

    fn context(&self) -> (Bytes, KeyGroup) {
        let key = self
            .current_key
            .clone()
            .expect("key context not set before state access");
        let kg = self.current_kg.expect("key context not set");
        (key, kg)
    }

    pub fn get(&self, namespace: &[u8]) -> Option<Bytes> {
        let (key, kg) = self.context();
        self.backend.get(kg, namespace, &key)
    }

    pub fn put(&mut self, namespace: &[u8], value: Bytes) {
        let (key, kg) = self.context();
        self.backend
            .put(kg, Bytes::copy_from_slice(namespace), key, value);
        self.changelog.insert(kg);
    }

    pub fn remove(&mut self, namespace: &[u8]) -> Option<Bytes> {
        let (key, kg) = self.context();
        let removed = self.backend.remove(kg, namespace, &key);
        if removed.is_some() {
            self.changelog.insert(kg);
        }
        removed
    }

    pub fn iter_key_group(&self, kg: KeyGroup) -> impl Iterator<Item = StateEntry> + '_ {
        self.backend.iter_key_group(kg)
    }

    pub fn changelog(&self) -> &HashSet<KeyGroup> {
        &self.changelog
    }

    /// Clear changelog entries without touching state, e.g. after a
    /// successful replication cycle.
    pub fn clear_changelog(&mut self, kgs: impl IntoIterator<Item = KeyGroup>) {
        for kg in kgs {
            self.changelog.remove(&kg);
        }
    }

    /// Relinquish ownership of the given key groups after migration: their
    /// changelog entries are cleared and their in-memory entries dropped.
    pub fn release_changelogs(&mut self, kgs: impl IntoIterator<Item = KeyGroup>) {
        for kg in kgs {
            self.changelog.remove(&kg);
            if self.backend.drop_key_group(kg) {
                trace!(kg = kg.as_u32(), "released key group state");
            }
        }
    }

    /// Synchronous snapshot phase: capture the given key groups' entries
    /// under the task lock. Serialization happens later, off the critical
    /// path, via [`StateTableSnapshot::into_handle`].
    pub fn snapshot(&self, kgs: impl IntoIterator<Item = KeyGroup>) -> StateTableSnapshot {
        let groups = kgs
            .into_iter()
            .map(|kg| {
                let entries = self.backend.iter_key_group(kg).collect();
                let modified = self.changelog.contains(&kg);
                (kg, modified, entries)
            })
            .collect();
        StateTableSnapshot { groups }
    }

    /// Apply one transferred frame. Entries overwrite existing ones, so
    /// re-delivery of the same frame is a no-op.
    pub fn ingest_frame(&mut self, kg: KeyGroup, frame: &Bytes) -> StorageResult<usize> {
        let entries = KeyGroupStateHandle::parse_frame(kg, frame)?;
        let count = entries.len();
        for entry in entries {
            self.backend.put(kg, entry.namespace, entry.key, entry.value);
        }
        self.changelog.insert(kg);
        Ok(count)
    }

    /// Ingest a whole handle, e.g. when promoting a replica.
    pub fn ingest_handle(&mut self, handle: KeyGroupStateHandle) -> StorageResult<usize> {
        if handle.is_summary() {
            return Err(StorageError::SummaryHandle);
        }
        let mut count = 0;
        for (kg, frame) in handle.decompose()? {
            count += self.ingest_frame(kg, &frame)?;
        }
        Ok(count)
    }

    pub fn is_empty_key_group(&self, kg: KeyGroup) -> bool {
        self.backend.is_empty_key_group(kg)
    }
}

/// The consistent view captured by the synchronous snapshot phase. Owns
/// cloned entries, so serializing it does not touch the live table.
pub struct StateTableSnapshot {
    /// `(kg, modified, entries)` in aligned order.
    groups: Vec<(KeyGroup, bool, Vec<StateEntry>)>,
}

impl StateTableSnapshot {
    pub fn covered_key_groups(&self) -> impl Iterator<Item = KeyGroup> + '_ {
        self.groups.iter().map(|(kg, _, _)| *kg)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|(_, _, entries)| entries.is_empty())
    }

    /// Asynchronous snapshot phase: serialize into a key-group-addressable
    /// handle. Runs wherever the caller spawns it.
    pub fn into_handle(self) -> KeyGroupStateHandle {
        let mut writer = HandleWriter::new();
        for (kg, modified, entries) in self.groups {
            writer.append(kg, modified, entries.into_iter());
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    use super::*;

    fn table() -> StateTable {
        StateTable::new_heap(8)
    }

    fn put(table: &mut StateTable, key: &str, value: &str) -> KeyGroup {
        table.set_current_key(key.as_bytes());
        table.put(b"ns", Bytes::copy_from_slice(value.as_bytes()));
        table.current_key_group().unwrap()
    }

    #[test]
    fn test_key_context_and_changelog() {
        let mut table = table();
        let kg_a = put(&mut table, "a", "1");
        let kg_b = put(&mut table, "b", "2");

        table.set_current_key(b"a");
        assert_eq!(table.get(b"ns"), Some(Bytes::from("1")));
        assert_eq!(table.get(b"other"), None);

        let mut dirty = table.changelog().iter().copied().collect_vec();
        dirty.sort();
        let mut expected = vec![kg_a, kg_b];
        expected.sort();
        expected.dedup();
        assert_eq!(dirty, expected);

        // A read never dirties the changelog.
        table.clear_changelog(vec![kg_a, kg_b]);
        table.set_current_key(b"a");
        let _ = table.get(b"ns");
        assert!(table.changelog().is_empty());
    }

    #[test]
    fn test_remove_only_dirties_on_hit() {
        let mut table = table();
        let kg = put(&mut table, "a", "1");
        table.clear_changelog(vec![kg]);

        table.set_current_key(b"a");
        assert_eq!(table.remove(b"missing"), None);
        assert!(table.changelog().is_empty());
        assert_eq!(table.remove(b"ns"), Some(Bytes::from("1")));
        assert_eq!(table.changelog().iter().copied().collect_vec(), vec![kg]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut source = table();
        let mut kgs = HashSet::new();
        for i in 0..32 {
            let key = format!("key-{}", i);
            kgs.insert(put(&mut source, &key, &format!("value-{}", i)));
        }

        let handle = source.snapshot(kgs.iter().copied()).into_handle();
        let mut destination = table();
        destination.ingest_handle(handle).unwrap();

        for kg in kgs {
            let from_source = source.iter_key_group(kg).collect_vec();
            let from_destination = destination.iter_key_group(kg).collect_vec();
            assert_eq!(from_source, from_destination);
        }
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let mut source = table();
        let kg = put(&mut source, "a", "1");
        put(&mut source, "a", "2");

        let parts = source.snapshot(vec![kg]).into_handle().decompose().unwrap();
        let (kg, frame) = parts.into_iter().exactly_one().ok().unwrap();

        let mut destination = table();
        destination.ingest_frame(kg, &frame).unwrap();
        let once = destination.iter_key_group(kg).collect_vec();
        destination.ingest_frame(kg, &frame).unwrap();
        let twice = destination.iter_key_group(kg).collect_vec();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_release_changelogs_drops_state() {
        let mut table = table();
        let kg = put(&mut table, "a", "1");
        assert!(!table.is_empty_key_group(kg));

        table.release_changelogs(vec![kg]);
        assert!(table.is_empty_key_group(kg));
        assert!(table.changelog().is_empty());
    }

    #[test]
    fn test_snapshot_marks_modified_bits() {
        let mut table = table();
        let kg_dirty = put(&mut table, "a", "1");
        // Find a key hashing to a different group.
        let kg_clean = (0..)
            .map(|i| put(&mut table, &format!("k{}", i), "2"))
            .find(|kg| *kg != kg_dirty)
            .unwrap();
        table.clear_changelog(vec![kg_clean]);

        let handle = table.snapshot(vec![kg_dirty, kg_clean]).into_handle();
        assert!(handle.is_modified(kg_dirty).unwrap());
        assert!(!handle.is_modified(kg_clean).unwrap());
    }
}
