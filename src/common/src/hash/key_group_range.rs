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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::KeyGroup;
use crate::error::{CommonError, Result};

/// The set of key groups owned by one subtask.
///
/// Two views are maintained: the *hashed* view holds the actual key group ids,
/// which become non-contiguous after rebalancing; the *aligned* view is the
/// dense `0..len` indexing used for byte offsets in snapshot artifacts. The
/// range keeps the bijection between the two.
///
/// Edits happen only under the task-local lock during reconfig; steady-state
/// reads come from the single task thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupRange {
    /// Hashed key groups in aligned order: `hashed[aligned_idx] == kg`.
    hashed: Vec<KeyGroup>,
    /// Inverse mapping: `kg -> aligned_idx`.
    #[serde(skip)]
    index: HashMap<KeyGroup, usize>,
}

impl KeyGroupRange {
    pub fn new(kgs: impl IntoIterator<Item = KeyGroup>) -> Self {
        let hashed: Vec<_> = kgs.into_iter().collect();
        let index = Self::build_index(&hashed);
        Self { hashed, index }
    }

    /// A dense range `start..end`, the shape every subtask starts with before
    /// any rebalancing.
    pub fn of(start: u32, end: u32) -> Self {
        Self::new((start..end).map(KeyGroup::new))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    fn build_index(hashed: &[KeyGroup]) -> HashMap<KeyGroup, usize> {
        hashed.iter().enumerate().map(|(i, &kg)| (kg, i)).collect()
    }

    /// Rebuild the inverse index, e.g. after deserialization.
    pub fn reindex(&mut self) {
        self.index = Self::build_index(&self.hashed);
    }

    pub fn len(&self) -> usize {
        self.hashed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashed.is_empty()
    }

    pub fn contains(&self, kg: KeyGroup) -> bool {
        self.index.contains_key(&kg)
    }

    pub fn map_from_aligned_to_hashed(&self, aligned_idx: usize) -> Result<KeyGroup> {
        self.hashed
            .get(aligned_idx)
            .copied()
            .ok_or(CommonError::AlignedIndexOutOfRange(
                aligned_idx,
                self.hashed.len(),
            ))
    }

    pub fn map_from_hashed_to_aligned(&self, kg: KeyGroup) -> Result<usize> {
        self.index
            .get(&kg)
            .copied()
            .ok_or(CommonError::KeyGroupNotOwned(kg.as_u32()))
    }

    /// Replace the owned set in place. Called during reconfig under the task
    /// lock.
    pub fn update(&mut self, new_range: KeyGroupRange) {
        *self = new_range;
    }

    /// Grow the range by one key group, appending to the aligned order.
    /// No-op if already owned.
    pub fn insert(&mut self, kg: KeyGroup) {
        if self.index.contains_key(&kg) {
            return;
        }
        self.index.insert(kg, self.hashed.len());
        self.hashed.push(kg);
    }

    /// Shrink the range by one key group. Aligned indices after the removed
    /// entry shift down by one.
    pub fn remove(&mut self, kg: KeyGroup) -> bool {
        let Some(pos) = self.index.remove(&kg) else {
            return false;
        };
        self.hashed.remove(pos);
        for (i, kg) in self.hashed.iter().enumerate().skip(pos) {
            self.index.insert(*kg, i);
        }
        true
    }

    /// Owned key groups in aligned order.
    pub fn iter(&self) -> impl Iterator<Item = KeyGroup> + '_ {
        self.hashed.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<KeyGroup> {
        self.hashed.clone()
    }
}

impl FromIterator<KeyGroup> for KeyGroupRange {
    fn from_iter<T: IntoIterator<Item = KeyGroup>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_aligned_hashed_bijection() {
        // A sparse post-rebalance range.
        let range = KeyGroupRange::new([7, 2, 5].map(KeyGroup::new));
        assert_eq!(range.len(), 3);
        assert_eq!(
            range.map_from_aligned_to_hashed(0).unwrap(),
            KeyGroup::new(7)
        );
        assert_eq!(
            range.map_from_aligned_to_hashed(2).unwrap(),
            KeyGroup::new(5)
        );
        assert_eq!(
            range.map_from_hashed_to_aligned(KeyGroup::new(2)).unwrap(),
            1
        );
        assert!(range.map_from_aligned_to_hashed(3).is_err());
        assert!(range
            .map_from_hashed_to_aligned(KeyGroup::new(0))
            .is_err());
    }

    #[test]
    fn test_insert_remove_keeps_bijection() {
        let mut range = KeyGroupRange::of(0, 4);
        assert!(range.remove(KeyGroup::new(1)));
        assert!(!range.remove(KeyGroup::new(1)));
        range.insert(KeyGroup::new(9));
        range.insert(KeyGroup::new(9));

        assert_eq!(
            range.iter().collect_vec(),
            [0, 2, 3, 9].map(KeyGroup::new).to_vec()
        );
        for (aligned, kg) in range.iter().enumerate() {
            assert_eq!(range.map_from_hashed_to_aligned(kg).unwrap(), aligned);
        }
    }

    #[test]
    fn test_update_in_place() {
        let mut range = KeyGroupRange::of(0, 4);
        range.update(KeyGroupRange::new([4, 5].map(KeyGroup::new)));
        assert!(!range.contains(KeyGroup::new(0)));
        assert!(range.contains(KeyGroup::new(5)));
        assert_eq!(range.len(), 2);
    }
}
