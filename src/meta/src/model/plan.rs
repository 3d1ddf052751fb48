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

use std::collections::{BTreeMap, HashMap, HashSet};

use itertools::Itertools;
use spacker_common::hash::{KeyGroup, KeyGroupRange};
use spacker_common::types::{IdInModel, SubtaskAddr, SubtaskIndex, ID_IN_MODEL_UNUSED};

use crate::error::{MetaError, MetaResult};

/// How one subtask participates in a reconfiguration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationRole {
    Unaffected,
    /// Loses at least one key group.
    Source,
    /// Gains at least one key group.
    Destination,
    SourceAndDestination,
}

/// The logical mapping requested for the next epoch: `id_in_model` to owned
/// key groups. Built by a planner strategy or supplied verbatim.
pub type LogicalAssignment = BTreeMap<IdInModel, Vec<KeyGroup>>;

/// Maps logical key groups to physical subtask slots across one
/// reconfiguration.
///
/// Slots are provisioned once (`num_opened_subtasks`) and may exceed the
/// running parallelism; unoccupied slots carry the `ID_IN_MODEL_UNUSED`
/// sentinel. A plan is immutable once constructed: the next reconfiguration
/// derives a fresh plan from this one and the new logical assignment, after
/// which this one is dropped.
#[derive(Clone, Debug)]
pub struct JobExecutionPlan {
    num_opened_subtasks: u32,

    /// Per slot: the key groups owned after this reconfiguration.
    partition_assignment: Vec<Vec<KeyGroup>>,

    /// Per slot: the logical subtask occupying it.
    subtask_index_mapping: Vec<IdInModel>,

    /// Per slot: aligned view of the owned key groups.
    aligned_key_group_ranges: Vec<KeyGroupRange>,

    /// Slots whose ownership changed in this reconfiguration.
    modified_subtasks: Vec<SubtaskIndex>,

    /// Per slot: key groups it loses.
    src_affected_kgs: Vec<Vec<KeyGroup>>,

    /// Per slot: key groups it gains.
    dst_affected_kgs: Vec<Vec<KeyGroup>>,

    /// For every migrating key group, where it is headed.
    src_kg_with_dst_addr: HashMap<KeyGroup, SubtaskAddr>,
}

impl JobExecutionPlan {
    /// The plan for a fresh job: every logical subtask occupies the slot of
    /// its own index, nothing migrates.
    pub fn initial(
        num_opened_subtasks: u32,
        assignment: &LogicalAssignment,
        max_parallelism: u32,
    ) -> MetaResult<Self> {
        validate_assignment(assignment, num_opened_subtasks, max_parallelism)?;

        let mut plan = Self::unoccupied(num_opened_subtasks);
        for (slot, (&id, kgs)) in assignment.iter().enumerate() {
            plan.occupy(slot as SubtaskIndex, id, kgs.clone());
        }
        Ok(plan)
    }

    /// Derive the plan for the next epoch from the previous plan and the new
    /// logical assignment, classifying every subtask's migration role.
    pub fn derive(prev: &JobExecutionPlan, assignment: &LogicalAssignment) -> MetaResult<Self> {
        let max_parallelism = prev.max_parallelism();
        validate_assignment(assignment, prev.num_opened_subtasks, max_parallelism)?;

        let old_ids: HashSet<IdInModel> = prev.occupied_ids().collect();
        let new_ids: HashSet<IdInModel> = assignment.keys().copied().collect();
        let added = new_ids.difference(&old_ids).copied().collect_vec();
        let removed = old_ids.difference(&new_ids).copied().collect_vec();

        // Scale out and scale in change the subtask set by exactly one;
        // repartition leaves it untouched. Anything else is malformed.
        match (added.len(), removed.len()) {
            (0, 0) | (1, 0) | (0, 1) => {}
            _ => {
                return Err(MetaError::InvalidPlan(format!(
                    "expected at most one added or removed subtask, got +{:?} -{:?}",
                    added, removed
                )))
            }
        }

        let mut plan = Self::unoccupied(prev.num_opened_subtasks);

        // Surviving subtasks keep their slots.
        for slot in 0..prev.num_opened_subtasks {
            let id = prev.subtask_index_mapping[slot as usize];
            if id == ID_IN_MODEL_UNUSED || !new_ids.contains(&id) {
                continue;
            }
            plan.occupy(slot, id, assignment[&id].clone());
        }

        // A scaled-out subtask takes the first free slot.
        for id in added {
            let slot = plan
                .subtask_index_mapping
                .iter()
                .position(|&m| m == ID_IN_MODEL_UNUSED)
                .ok_or_else(|| {
                    MetaError::InvalidPlan(format!(
                        "no free slot for new subtask {} among {} provisioned",
                        id, prev.num_opened_subtasks
                    ))
                })?;
            plan.occupy(slot as SubtaskIndex, id, assignment[&id].clone());
        }

        debug_assert_eq!(
            plan.occupied_ids().count(),
            assignment.len(),
            "occupied slots must equal the new parallelism"
        );

        plan.classify_against(prev)?;
        Ok(plan)
    }

    fn unoccupied(num_opened_subtasks: u32) -> Self {
        let slots = num_opened_subtasks as usize;
        Self {
            num_opened_subtasks,
            partition_assignment: vec![Vec::new(); slots],
            subtask_index_mapping: vec![ID_IN_MODEL_UNUSED; slots],
            aligned_key_group_ranges: vec![KeyGroupRange::empty(); slots],
            modified_subtasks: Vec::new(),
            src_affected_kgs: vec![Vec::new(); slots],
            dst_affected_kgs: vec![Vec::new(); slots],
            src_kg_with_dst_addr: HashMap::new(),
        }
    }

    fn occupy(&mut self, slot: SubtaskIndex, id: IdInModel, kgs: Vec<KeyGroup>) {
        let aligned = KeyGroupRange::new(kgs.iter().copied());
        let slot = slot as usize;
        self.subtask_index_mapping[slot] = id;
        self.aligned_key_group_ranges[slot] = aligned;
        self.partition_assignment[slot] = kgs;
    }

    /// Compute the per-slot source/destination sets against the previous
    /// plan, and the destination address of every migrating key group.
    fn classify_against(&mut self, prev: &JobExecutionPlan) -> MetaResult<()> {
        // Where each kg lands in the new plan, for routing sources.
        let mut dst_addr_of_kg: HashMap<KeyGroup, SubtaskAddr> = HashMap::new();

        for slot in 0..self.num_opened_subtasks as usize {
            let old_kgs: HashSet<KeyGroup> =
                prev.partition_assignment[slot].iter().copied().collect();
            let new_kgs: HashSet<KeyGroup> =
                self.partition_assignment[slot].iter().copied().collect();

            let src = self.partition_ordered(prev, slot, &old_kgs, &new_kgs, true);
            let dst = self.partition_ordered(prev, slot, &old_kgs, &new_kgs, false);

            for &kg in &dst {
                let addr = SubtaskAddr {
                    subtask_index: slot as SubtaskIndex,
                    id_in_model: self.subtask_index_mapping[slot],
                };
                if dst_addr_of_kg.insert(kg, addr).is_some() {
                    return Err(MetaError::PlanConflict(kg.as_u32()));
                }
            }

            if !src.is_empty() || !dst.is_empty() {
                self.modified_subtasks.push(slot as SubtaskIndex);
            }
            self.src_affected_kgs[slot] = src;
            self.dst_affected_kgs[slot] = dst;
        }

        for slot in 0..self.num_opened_subtasks as usize {
            for &kg in &self.src_affected_kgs[slot] {
                let addr = *dst_addr_of_kg.get(&kg).ok_or_else(|| {
                    MetaError::InvalidPlan(format!("migrating key group {} has no destination", kg))
                })?;
                self.src_kg_with_dst_addr.insert(kg, addr);
            }
        }
        Ok(())
    }

    /// Keep set-difference results in the deterministic order of the plan
    /// they came from, so aligned indices and transfer order are stable.
    fn partition_ordered(
        &self,
        prev: &JobExecutionPlan,
        slot: usize,
        old_kgs: &HashSet<KeyGroup>,
        new_kgs: &HashSet<KeyGroup>,
        source_side: bool,
    ) -> Vec<KeyGroup> {
        if source_side {
            prev.partition_assignment[slot]
                .iter()
                .copied()
                .filter(|kg| !new_kgs.contains(kg))
                .collect()
        } else {
            self.partition_assignment[slot]
                .iter()
                .copied()
                .filter(|kg| !old_kgs.contains(kg))
                .collect()
        }
    }

    pub fn num_opened_subtasks(&self) -> u32 {
        self.num_opened_subtasks
    }

    pub fn max_parallelism(&self) -> u32 {
        self.partition_assignment
            .iter()
            .map(|kgs| kgs.len() as u32)
            .sum()
    }

    pub fn parallelism(&self) -> u32 {
        self.occupied_ids().count() as u32
    }

    pub fn occupied_ids(&self) -> impl Iterator<Item = IdInModel> + '_ {
        self.subtask_index_mapping
            .iter()
            .copied()
            .filter(|&id| id != ID_IN_MODEL_UNUSED)
    }

    pub fn occupied_slots(&self) -> impl Iterator<Item = SubtaskIndex> + '_ {
        self.subtask_index_mapping
            .iter()
            .enumerate()
            .filter(|(_, &id)| id != ID_IN_MODEL_UNUSED)
            .map(|(slot, _)| slot as SubtaskIndex)
    }

    pub fn id_in_model(&self, slot: SubtaskIndex) -> IdInModel {
        self.subtask_index_mapping[slot as usize]
    }

    pub fn assignment(&self, slot: SubtaskIndex) -> &[KeyGroup] {
        &self.partition_assignment[slot as usize]
    }

    pub fn aligned_range(&self, slot: SubtaskIndex) -> &KeyGroupRange {
        &self.aligned_key_group_ranges[slot as usize]
    }

    pub fn modified_subtasks(&self) -> &[SubtaskIndex] {
        &self.modified_subtasks
    }

    pub fn source_kgs(&self, slot: SubtaskIndex) -> &[KeyGroup] {
        &self.src_affected_kgs[slot as usize]
    }

    pub fn destination_kgs(&self, slot: SubtaskIndex) -> &[KeyGroup] {
        &self.dst_affected_kgs[slot as usize]
    }

    pub fn role(&self, slot: SubtaskIndex) -> MigrationRole {
        let src = !self.src_affected_kgs[slot as usize].is_empty();
        let dst = !self.dst_affected_kgs[slot as usize].is_empty();
        match (src, dst) {
            (false, false) => MigrationRole::Unaffected,
            (true, false) => MigrationRole::Source,
            (false, true) => MigrationRole::Destination,
            (true, true) => MigrationRole::SourceAndDestination,
        }
    }

    /// Destination of a migrating key group, if any migrates.
    pub fn destination_of(&self, kg: KeyGroup) -> Option<SubtaskAddr> {
        self.src_kg_with_dst_addr.get(&kg).copied()
    }

    /// Every key group moving in this reconfiguration.
    pub fn migrating_key_groups(&self) -> impl Iterator<Item = KeyGroup> + '_ {
        self.src_kg_with_dst_addr.keys().copied()
    }

    /// The slot currently owning a key group.
    pub fn owner_of(&self, kg: KeyGroup) -> Option<SubtaskIndex> {
        self.partition_assignment
            .iter()
            .position(|kgs| kgs.contains(&kg))
            .map(|slot| slot as SubtaskIndex)
    }

    /// Content digest carried on reconfig-point barriers so tasks can verify
    /// they snapshot under the plan the coordinator computed.
    pub fn digest(&self) -> u128 {
        let mut digest: u128 = 0xcbf2_9ce4_8422_2325;
        for (slot, kgs) in self.partition_assignment.iter().enumerate() {
            digest = digest
                .wrapping_mul(0x0100_0000_01b3)
                .wrapping_add(self.subtask_index_mapping[slot] as u128);
            for kg in kgs {
                digest = digest
                    .wrapping_mul(0x0100_0000_01b3)
                    .wrapping_add(kg.as_u32() as u128 + 1);
            }
        }
        digest
    }
}

fn validate_assignment(
    assignment: &LogicalAssignment,
    num_opened_subtasks: u32,
    max_parallelism: u32,
) -> MetaResult<()> {
    if assignment.len() as u32 > num_opened_subtasks {
        return Err(MetaError::InvalidPlan(format!(
            "{} subtasks requested but only {} slots provisioned",
            assignment.len(),
            num_opened_subtasks
        )));
    }

    let mut seen = HashSet::new();
    for kgs in assignment.values() {
        for &kg in kgs {
            if !seen.insert(kg) {
                return Err(MetaError::PlanConflict(kg.as_u32()));
            }
            if kg.as_u32() >= max_parallelism {
                return Err(MetaError::InvalidPlan(format!(
                    "key group {} outside [0, {})",
                    kg, max_parallelism
                )));
            }
        }
    }
    if seen.len() as u32 != max_parallelism {
        return Err(MetaError::InvalidPlan(format!(
            "assignment covers {} of {} key groups",
            seen.len(),
            max_parallelism
        )));
    }
    Ok(())
}
