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

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use rand::Rng;
use spacker_common::config::OrderFunction;
use spacker_common::hash::KeyGroup;
use spacker_common::types::ReconfigId;

use crate::executor::StreamRecord;

/// How this task participates in the reconfiguration in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationMode {
    Normal,
    Source,
    Destination,
    SourceAndDestination,
}

/// Migration-scoped state of one task. Mutated by the control handlers and
/// read by the task loop, always under the task lock.
pub struct MigrationState {
    mode: MigrationMode,
    reconfig_id: Option<ReconfigId>,
    order_function: OrderFunction,

    /// Key groups in flight to me as destination; records for them are
    /// buffered, not processed.
    migrating: HashSet<KeyGroup>,

    /// Key groups whose state arrived, drain pending.
    migrated: Vec<KeyGroup>,

    /// Per-group record buffers, in arrival order.
    buffered: HashMap<KeyGroup, VecDeque<StreamRecord>>,

    /// Key groups drained and processed live, but not yet folded into the
    /// owned range (that happens on commit).
    adopted: HashSet<KeyGroup>,

    /// Key groups leaving this task; the operator is no longer invoked for
    /// them.
    outgoing: HashSet<KeyGroup>,

    /// Last ingested payload version per group, making re-delivery a no-op.
    ingested_versions: HashMap<KeyGroup, u64>,

    /// Replica payloads held on behalf of other tasks.
    replica_store: HashMap<KeyGroup, (u64, Bytes)>,

    /// Which key groups proactive replication covers. `None` means all.
    backup_kgs: Option<HashSet<KeyGroup>>,

    /// Versions this task successfully replicated out, per group.
    replicated_versions: HashMap<KeyGroup, u64>,
}

impl MigrationState {
    pub fn new() -> Self {
        Self {
            mode: MigrationMode::Normal,
            reconfig_id: None,
            order_function: OrderFunction::Default,
            migrating: HashSet::new(),
            migrated: Vec::new(),
            buffered: HashMap::new(),
            adopted: HashSet::new(),
            outgoing: HashSet::new(),
            ingested_versions: HashMap::new(),
            replica_store: HashMap::new(),
            backup_kgs: None,
            replicated_versions: HashMap::new(),
        }
    }

    pub fn mode(&self) -> MigrationMode {
        self.mode
    }

    pub fn reconfig_id(&self) -> Option<ReconfigId> {
        self.reconfig_id
    }

    pub fn in_migration(&self) -> bool {
        self.mode != MigrationMode::Normal
    }

    /// Enter migration mode at the reconfig-point barrier.
    pub fn begin(
        &mut self,
        reconfig_id: ReconfigId,
        outgoing: impl IntoIterator<Item = KeyGroup>,
        incoming: impl IntoIterator<Item = KeyGroup>,
        order_function: OrderFunction,
    ) {
        self.reconfig_id = Some(reconfig_id);
        self.order_function = order_function;
        self.outgoing = outgoing.into_iter().collect();
        self.migrating = incoming.into_iter().collect();
        self.mode = match (!self.outgoing.is_empty(), !self.migrating.is_empty()) {
            (false, false) => MigrationMode::Normal,
            (true, false) => MigrationMode::Source,
            (false, true) => MigrationMode::Destination,
            (true, true) => MigrationMode::SourceAndDestination,
        };
    }

    /// Destination rule: records for in-flight groups are queued, never
    /// handed to the operator. A group stays queued until its drain ran,
    /// even if the state already arrived or the reconfig already committed,
    /// so buffered records never reorder with live ones.
    pub fn should_buffer(&self, kg: KeyGroup) -> bool {
        self.migrating.contains(&kg)
            || self.migrated.contains(&kg)
            || self.buffered.contains_key(&kg)
    }

    pub fn buffer_record(&mut self, kg: KeyGroup, record: StreamRecord) {
        self.buffered.entry(kg).or_default().push_back(record);
    }

    /// Source rule: once the group is on its way out, stop invoking the
    /// operator for it.
    pub fn is_outgoing(&self, kg: KeyGroup) -> bool {
        self.outgoing.contains(&kg)
    }

    pub fn is_adopted(&self, kg: KeyGroup) -> bool {
        self.adopted.contains(&kg)
    }

    /// Record an arriving state payload. Returns false for a duplicate
    /// delivery of the same version, which must be ignored.
    pub fn on_state_arrived(&mut self, kg: KeyGroup, version: u64) -> bool {
        if self.ingested_versions.get(&kg) == Some(&version) {
            return false;
        }
        self.ingested_versions.insert(kg, version);
        true
    }

    /// Whether this exact payload version was already delivered, e.g. when
    /// a transfer raced ahead of the reconfig-point barrier.
    pub fn has_arrived(&self, kg: KeyGroup, version: u64) -> bool {
        self.ingested_versions.get(&kg) == Some(&version)
    }

    /// The group's state is in the table; queue it for draining.
    pub fn mark_ready(&mut self, kg: KeyGroup) {
        if self.migrating.remove(&kg) {
            self.migrated.push(kg);
        }
    }

    /// Pick the next group to drain, honoring the configured order function,
    /// and hand out its buffered records. The drain of one group is atomic
    /// with respect to the operator; the caller holds the task lock.
    pub fn next_drain(&mut self) -> Option<(KeyGroup, VecDeque<StreamRecord>)> {
        if self.migrated.is_empty() {
            return None;
        }
        let idx = match self.order_function {
            OrderFunction::Default => {
                let min = self.migrated.iter().min().unwrap();
                self.migrated.iter().position(|kg| kg == min).unwrap()
            }
            OrderFunction::Reverse => {
                let max = self.migrated.iter().max().unwrap();
                self.migrated.iter().position(|kg| kg == max).unwrap()
            }
            OrderFunction::Random => rand::thread_rng().gen_range(0..self.migrated.len()),
        };
        let kg = self.migrated.swap_remove(idx);
        self.adopted.insert(kg);
        let records = self.buffered.remove(&kg).unwrap_or_default();
        Some((kg, records))
    }

    /// Whether every in-flight group arrived and drained.
    pub fn drained(&self) -> bool {
        self.migrating.is_empty() && self.migrated.is_empty() && self.buffered.is_empty()
    }

    /// Leave migration mode after the coordinator committed. Returns the
    /// groups adopted by this task. Pending drains survive: the commit only
    /// requires ingestion, so a destination may still hold buffered records
    /// here, and the task loop drains them right after.
    pub fn finish(&mut self) -> Vec<KeyGroup> {
        let adopted = self.adopted.drain().collect();
        self.reconfig_id = None;
        self.mode = MigrationMode::Normal;
        self.migrating.clear();
        self.outgoing.clear();
        adopted
    }

    /// Abort: discard buffers and partial transfers, revert to normal
    /// processing under the old plan. Returns the groups whose ingested
    /// state must be dropped again.
    pub fn cancel(&mut self) -> Vec<KeyGroup> {
        let partial: Vec<KeyGroup> = self
            .adopted
            .drain()
            .chain(self.migrated.drain(..))
            .collect();
        self.reconfig_id = None;
        self.mode = MigrationMode::Normal;
        self.migrating.clear();
        self.buffered.clear();
        self.outgoing.clear();
        for kg in &partial {
            self.ingested_versions.remove(kg);
        }
        partial
    }

    /// Record a source-side release of migrated-out groups.
    pub fn on_released(&mut self, kgs: &[KeyGroup]) {
        for kg in kgs {
            self.outgoing.remove(kg);
        }
    }

    // Replication bookkeeping.

    pub fn set_backup_key_groups(&mut self, kgs: impl IntoIterator<Item = KeyGroup>) {
        self.backup_kgs = Some(kgs.into_iter().collect());
    }

    pub fn should_replicate(&self, kg: KeyGroup, filter: u32) -> bool {
        if filter == 0 || kg.as_u32() % filter != 0 {
            return false;
        }
        match &self.backup_kgs {
            None => true,
            Some(kgs) => kgs.contains(&kg),
        }
    }

    pub fn store_replica(&mut self, kg: KeyGroup, version: u64, payload: Bytes) {
        let stale = matches!(self.replica_store.get(&kg), Some((v, _)) if *v >= version);
        if !stale {
            self.replica_store.insert(kg, (version, payload));
        }
    }

    /// Consume the replica for promotion to live state. Only the exact
    /// version the source named is acceptable.
    pub fn take_replica(&mut self, kg: KeyGroup, version: u64) -> Option<Bytes> {
        match self.replica_store.get(&kg) {
            Some((v, _)) if *v == version => {
                self.replica_store.remove(&kg).map(|(_, payload)| payload)
            }
            _ => None,
        }
    }

    /// The stored replica version, if any. Does not consume it.
    pub fn replica_version(&self, kg: KeyGroup) -> Option<u64> {
        self.replica_store.get(&kg).map(|(v, _)| *v)
    }

    pub fn record_replicated(&mut self, kg: KeyGroup, version: u64) {
        self.replicated_versions.insert(kg, version);
    }

    pub fn replicated_version(&self, kg: KeyGroup) -> Option<u64> {
        self.replicated_versions.get(&kg).copied()
    }
}

impl Default for MigrationState {
    fn default() -> Self {
        Self::new()
    }
}
