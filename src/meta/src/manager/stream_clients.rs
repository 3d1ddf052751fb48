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

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use spacker_common::config::OrderFunction;
use spacker_common::hash::{KeyGroup, KeyGroupRange};
use spacker_common::types::{ExecutionId, IdInModel, OperatorId, ReconfigId, SubtaskIndex};

use crate::error::{MetaError, MetaResult};
use crate::model::JobExecutionPlan;

/// Everything a task needs to act on a reconfig-point barrier. Travels with
/// the barrier through the regular record channels.
#[derive(Clone, Debug)]
pub struct ReconfigBarrierInfo {
    pub reconfig_id: ReconfigId,
    pub timestamp_ms: u64,
    pub plan_digest: u128,
    pub plan: Arc<JobExecutionPlan>,
    pub order_function: OrderFunction,
}

/// The control surface the coordinator and peer tasks speak to a subtask.
///
/// The engine's RPC transport is an external collaborator; within one process
/// the implementation dispatches straight into the local stream manager.
#[async_trait]
pub trait StreamControlClient: Send + Sync + 'static {
    /// Reinitialize a subtask's ownership after a committed reconfiguration.
    async fn dispatch_state_to_task(
        &self,
        execution_id: ExecutionId,
        operator_id: OperatorId,
        key_group_range: KeyGroupRange,
        id_in_model: IdInModel,
    ) -> MetaResult<()>;

    /// Ship one key group's state payload to its destination. One group per
    /// call so transfers of different groups interleave.
    async fn dispatch_state(
        &self,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        payload: Bytes,
    ) -> MetaResult<()>;

    /// Tell a migrating destination to promote its replica of the key group
    /// instead of waiting for a payload.
    async fn promote_replica(
        &self,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        reconfig_id: ReconfigId,
    ) -> MetaResult<()>;

    /// Ship a proactive replication delta for one key group. The receiver
    /// stores it in its replica store; it is not live state.
    async fn dispatch_replica(
        &self,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        payload: Bytes,
    ) -> MetaResult<()>;

    /// Set the replica target set for proactive replication.
    async fn update_backup_key_groups(
        &self,
        execution_id: ExecutionId,
        operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
    ) -> MetaResult<()>;

    /// Tell a source it may relinquish the given migrated-out key groups;
    /// called once their destination acknowledged ingestion.
    async fn release_key_groups(
        &self,
        reconfig_id: ReconfigId,
        operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
    ) -> MetaResult<()>;

    /// Notify that the reconfiguration committed; tasks leave migration mode.
    async fn finish_reconfig(&self, reconfig_id: ReconfigId) -> MetaResult<()>;
}

/// Entry point for control barriers. Implemented by the node hosting the
/// dataflow's source executors; barriers then propagate through the regular
/// record channels.
#[async_trait]
pub trait BarrierInjector: Send + Sync + 'static {
    async fn inject_reconfig_barrier(&self, info: ReconfigBarrierInfo) -> MetaResult<()>;

    /// Broadcast a cancel marker for an in-flight reconfiguration.
    async fn inject_cancel(&self, reconfig_id: ReconfigId) -> MetaResult<()>;
}

/// Maintains control clients to known subtasks, mapping
/// `subtask_index` => `(execution_id, client)`.
#[derive(Default)]
pub struct StreamClients {
    clients: DashMap<SubtaskIndex, (ExecutionId, Arc<dyn StreamControlClient>)>,
}

impl StreamClients {
    pub fn register(
        &self,
        subtask_index: SubtaskIndex,
        execution_id: ExecutionId,
        client: Arc<dyn StreamControlClient>,
    ) {
        self.clients.insert(subtask_index, (execution_id, client));
    }

    pub fn get(&self, subtask_index: SubtaskIndex) -> MetaResult<Arc<dyn StreamControlClient>> {
        Ok(self.entry(subtask_index)?.1)
    }

    pub fn execution_id(&self, subtask_index: SubtaskIndex) -> MetaResult<ExecutionId> {
        Ok(self.entry(subtask_index)?.0)
    }

    fn entry(
        &self,
        subtask_index: SubtaskIndex,
    ) -> MetaResult<(ExecutionId, Arc<dyn StreamControlClient>)> {
        self.clients
            .get(&subtask_index)
            .map(|entry| entry.value().clone())
            .ok_or(MetaError::ClientUnavailable(subtask_index))
    }

    pub fn subtask_indexes(&self) -> Vec<SubtaskIndex> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }
}

pub type StreamClientsRef = Arc<StreamClients>;
