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
use std::sync::Arc;

use futures::channel::mpsc::{channel, Receiver, Sender};
use parking_lot::Mutex;
use spacker_common::config::SpackerConfig;
use spacker_common::hash::KeyGroup;
use spacker_common::types::{ExecutionId, SubtaskIndex};
use spacker_meta::manager::StreamClients;
use spacker_meta::model::{JobExecutionPlan, LogicalAssignment};
use spacker_meta::reconfig::{CoordinatorHandle, ReconfigCoordinator};
use spacker_meta::MetaResult;
use spacker_storage::HeapStateBackend;
use spacker_stream::executor::{KeyedCountOperator, Message};
use spacker_stream::replicator::StateReplicator;
use spacker_stream::task::{LocalStreamManager, SOURCE_TASK_ID};
use spacker_stream::StreamResult;
use tracing::info;

use crate::rpc::{LocalBarrierInjector, StreamServiceImpl};

const NODE_CHANNEL_SIZE: usize = 1024;
const KEYED_COUNT_OPERATOR_ID: u64 = 1;

/// One fully wired node: provisioned subtasks running the keyed counting
/// operator, the partitioner stage, the control service and the reconfig
/// coordinator. Records go in through [`ComputeNode::record_sender`]; each
/// subtask's output comes back on its sink channel.
///
/// Every provisioned slot runs a task from the start; slots beyond the
/// initial parallelism idle with an empty range until a scale-out assigns
/// them key groups.
pub struct ComputeNode {
    config: Arc<SpackerConfig>,
    manager: Arc<LocalStreamManager>,
    coordinator: CoordinatorHandle,
    injector: Arc<LocalBarrierInjector>,
    record_tx: Sender<Message>,
    sinks: Mutex<HashMap<SubtaskIndex, Receiver<Message>>>,
    replicators: Mutex<Vec<StateReplicator<HeapStateBackend>>>,
}

impl ComputeNode {
    /// Lay out the topology for the given logical assignment and start
    /// everything.
    pub async fn start(
        config: SpackerConfig,
        num_opened_subtasks: u32,
        assignment: &LogicalAssignment,
    ) -> MetaResult<Self> {
        let config = Arc::new(config);
        let plan =
            JobExecutionPlan::initial(num_opened_subtasks, assignment, config.max_parallelism)?;

        let clients = Arc::new(StreamClients::default());
        let manager = Arc::new(LocalStreamManager::new(config.clone(), clients.clone()));

        // Record entry, one pooled channel from the partitioner to each task,
        // one sink each.
        let (record_tx, record_rx) = channel(NODE_CHANNEL_SIZE);
        let context = manager.context().clone();
        let mut outputs = HashMap::new();
        let mut task_inputs = HashMap::new();
        let mut sinks = HashMap::new();
        let mut sink_txs = HashMap::new();
        for slot in 0..num_opened_subtasks {
            let ids = (SOURCE_TASK_ID, slot);
            context.add_channel_pair(ids);
            outputs.insert(slot, context.take_sender(&ids).expect("channel just added"));
            task_inputs.insert(
                slot,
                context.take_receiver(&ids).expect("channel just added"),
            );
            let (sink_tx, sink_rx) = channel(NODE_CHANNEL_SIZE);
            sink_txs.insert(slot, sink_tx);
            sinks.insert(slot, sink_rx);
        }

        let mut routing = HashMap::new();
        for slot in plan.occupied_slots() {
            for &kg in plan.assignment(slot) {
                routing.insert(kg, slot);
            }
        }
        manager.build_partitioner(record_rx, routing, outputs);

        let injector = Arc::new(LocalBarrierInjector::new(manager.clone()));
        let (coordinator, _coordinator_join) = ReconfigCoordinator::start(
            (*config).clone(),
            clients.clone(),
            injector.clone(),
            plan.clone(),
        );
        manager.set_coordinator(coordinator.clone());

        for slot in 0..num_opened_subtasks {
            clients.register(
                slot,
                slot as ExecutionId,
                Arc::new(StreamServiceImpl::new(manager.clone(), slot)),
            );
        }

        for slot in 0..num_opened_subtasks {
            manager
                .build_task(
                    slot,
                    slot as ExecutionId,
                    plan.id_in_model(slot),
                    KEYED_COUNT_OPERATOR_ID,
                    plan.assignment(slot).to_vec(),
                    HeapStateBackend::new(config.max_parallelism),
                    Box::new(KeyedCountOperator),
                    vec![task_inputs.remove(&slot).unwrap()],
                    sink_txs.remove(&slot).unwrap(),
                )
                .map_err(|e| spacker_meta::MetaError::Internal(anyhow::anyhow!(e)))?;
        }

        let replicators = (0..num_opened_subtasks)
            .filter(|_| config.replication.replicate_keys_filter > 0)
            .map(|slot| {
                StateReplicator::new(
                    manager.task_core(slot).expect("task just built"),
                    clients.clone(),
                    config.clone(),
                )
            })
            .collect();

        info!(
            parallelism = plan.parallelism(),
            slots = num_opened_subtasks,
            "compute node started"
        );
        Ok(Self {
            config,
            manager,
            coordinator,
            injector,
            record_tx,
            sinks: Mutex::new(sinks),
            replicators: Mutex::new(replicators),
        })
    }

    pub fn config(&self) -> &Arc<SpackerConfig> {
        &self.config
    }

    pub fn manager(&self) -> &Arc<LocalStreamManager> {
        &self.manager
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Feed records into the pipeline.
    pub fn record_sender(&self) -> Sender<Message> {
        self.record_tx.clone()
    }

    /// Take a subtask's output channel. Each sink can be taken once.
    pub fn take_sink(&self, slot: SubtaskIndex) -> Option<Receiver<Message>> {
        self.sinks.lock().remove(&slot)
    }

    /// Run one proactive replication cycle on every task, synchronously.
    /// Deterministic alternative to the replicators' own timers.
    pub async fn replicate_once(&self) {
        let mut replicators = std::mem::take(&mut *self.replicators.lock());
        for replicator in replicators.iter_mut() {
            replicator.cycle().await;
        }
        *self.replicators.lock() = replicators;
    }

    /// Hand the replicators their own timers instead of manual cycles.
    pub fn spawn_replicators(&self) {
        for replicator in self.replicators.lock().drain(..) {
            replicator.spawn();
        }
    }

    /// Inject an ordinary checkpoint barrier and wait for alignment.
    pub async fn checkpoint(&self) -> MetaResult<()> {
        self.injector.inject_checkpoint().await
    }

    /// Current per-key-group load counters, merged across tasks.
    pub fn load_stats(&self) -> HashMap<KeyGroup, u64> {
        self.manager.collect_load_stats()
    }

    /// Find a key that routes to the given key group. Probes a deterministic
    /// key sequence, so the same group always yields the same key.
    pub fn key_for_group(&self, kg: KeyGroup) -> Vec<u8> {
        let max_parallelism = self.config.max_parallelism;
        (0u64..)
            .map(|i| format!("key-{}", i).into_bytes())
            .find(|key| KeyGroup::from_key(key, max_parallelism) == kg)
            .expect("probe space exhausted")
    }

    /// Stop every task at its next dispatch boundary.
    pub fn shutdown(&self) -> StreamResult<()> {
        for slot in self.manager.subtask_indexes() {
            self.manager.drop_task(slot)?;
        }
        Ok(())
    }
}
