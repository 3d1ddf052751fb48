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

use bytes::Bytes;
use futures::channel::mpsc::{Receiver, Sender};
use futures::StreamExt;
use parking_lot::Mutex;
use spacker_common::config::SpackerConfig;
use spacker_common::hash::{KeyGroup, KeyGroupRange};
use spacker_common::types::{ExecutionId, IdInModel, OperatorId, ReconfigId, SubtaskIndex};
use spacker_meta::manager::StreamClientsRef;
use spacker_meta::reconfig::{CoordinatorHandle, KgStatus};
use spacker_storage::{HeapStateBackend, StateBackend, StateTable, StorageError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ChannelRewirer, DispatcherControl, DispatcherHandle, InputProcessor, MigrationState,
    SharedContext, TaskControl, TaskCore, SOURCE_TASK_ID,
};
use crate::error::{StreamError, StreamResult};
use crate::executor::{Barrier, HashDataDispatcher, KeyedOperator, MergeExecutor, Message};

pub struct TaskHandle<S: StateBackend> {
    pub core: Arc<Mutex<TaskCore<S>>>,
    pub control_tx: tokio::sync::mpsc::UnboundedSender<TaskControl>,
    pub notify: Arc<Notify>,
    pub join: JoinHandle<StreamResult<()>>,
}

/// Per-node owner of the running subtasks and the partitioner stage.
/// Control-plane calls (state dispatch, releases, ownership updates) land
/// here and mutate the task cores under their locks; the task loops observe
/// the changes at the next dispatch boundary.
pub struct LocalStreamManager<S: StateBackend = HeapStateBackend> {
    context: Arc<SharedContext>,
    config: Arc<SpackerConfig>,
    clients: StreamClientsRef,
    coordinator: Mutex<Option<CoordinatorHandle>>,
    tasks: Mutex<HashMap<SubtaskIndex, TaskHandle<S>>>,
    rewirer: Mutex<Option<Arc<ChannelRewirer>>>,
}

impl<S: StateBackend> LocalStreamManager<S> {
    pub fn new(config: Arc<SpackerConfig>, clients: StreamClientsRef) -> Self {
        Self {
            context: Arc::new(SharedContext::new()),
            config,
            clients,
            coordinator: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            rewirer: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SharedContext> {
        &self.context
    }

    pub fn config(&self) -> &Arc<SpackerConfig> {
        &self.config
    }

    /// Wire the coordinator handle in once it is started; the coordinator in
    /// turn needs this node as its barrier injector.
    pub fn set_coordinator(&self, handle: CoordinatorHandle) {
        *self.coordinator.lock() = Some(handle);
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.coordinator
            .lock()
            .clone()
            .expect("coordinator not wired")
    }

    pub fn rewirer(&self) -> StreamResult<Arc<ChannelRewirer>> {
        self.rewirer
            .lock()
            .clone()
            .ok_or_else(|| StreamError::RewireFailure("partitioner not built".to_string()))
    }

    /// Build the source stage and the partitioner: external records enter
    /// through `record_rx`, barriers are injected by the barrier manager,
    /// and both flow into the hash dispatcher.
    pub fn build_partitioner(
        &self,
        record_rx: Receiver<Message>,
        routing: HashMap<KeyGroup, SubtaskIndex>,
        outputs: HashMap<SubtaskIndex, Sender<Message>>,
    ) -> Arc<ChannelRewirer> {
        let (barrier_tx, barrier_rx) = unbounded_channel();
        self.context
            .lock_barrier_manager()
            .register_sender(SOURCE_TASK_ID, barrier_tx);

        let (source_tx, source_rx) =
            futures::channel::mpsc::channel(super::LOCAL_OUTPUT_CHANNEL_SIZE);
        tokio::spawn(run_source(record_rx, barrier_rx, source_tx));

        let (control_tx, control_rx) = unbounded_channel();
        let dispatcher =
            HashDataDispatcher::new(self.config.max_parallelism, routing, outputs);
        tokio::spawn(run_partitioner(source_rx, control_rx, dispatcher));

        let rewirer = Arc::new(ChannelRewirer::new(DispatcherHandle { control_tx }));
        *self.rewirer.lock() = Some(rewirer.clone());
        rewirer
    }

    /// Build one subtask and start its input processor.
    #[allow(clippy::too_many_arguments)]
    pub fn build_task(
        &self,
        subtask_index: SubtaskIndex,
        execution_id: ExecutionId,
        id_in_model: IdInModel,
        operator_id: OperatorId,
        key_groups: Vec<KeyGroup>,
        backend: S,
        operator: Box<dyn KeyedOperator<S>>,
        inputs: Vec<Receiver<Message>>,
        output: Sender<Message>,
    ) -> StreamResult<()> {
        let core = Arc::new(Mutex::new(TaskCore {
            subtask_index,
            execution_id,
            id_in_model,
            operator_id,
            range: KeyGroupRange::new(key_groups),
            state_table: StateTable::with_backend(backend, self.config.max_parallelism),
            migration: MigrationState::new(),
            load_stats: HashMap::new(),
        }));
        let (control_tx, control_rx) = unbounded_channel();
        let notify = Arc::new(Notify::new());

        let operator_name = operator.identity().to_string();
        let processor = InputProcessor::new(
            core.clone(),
            MergeExecutor::new(inputs),
            operator,
            output,
            control_rx,
            notify.clone(),
            self.context.clone(),
            self.coordinator(),
            self.clients.clone(),
            self.config.clone(),
        );
        let join = tokio::spawn(processor.run());

        if let Ok(rewirer) = self.rewirer() {
            rewirer.register_task(subtask_index, control_tx.clone());
        }
        info!(subtask_index, id_in_model, operator = %operator_name, "subtask built");
        self.tasks.lock().insert(
            subtask_index,
            TaskHandle {
                core,
                control_tx,
                notify,
                join,
            },
        );
        Ok(())
    }

    /// Stop one subtask at its next dispatch boundary; pending buffered
    /// records are dropped.
    pub fn drop_task(&self, subtask_index: SubtaskIndex) -> StreamResult<()> {
        let handle = self
            .tasks
            .lock()
            .remove(&subtask_index)
            .ok_or(StreamError::TaskNotFound(subtask_index))?;
        let _ = handle.control_tx.send(TaskControl::Stop);
        handle.notify.notify_one();
        if let Ok(rewirer) = self.rewirer() {
            rewirer.unregister_task(subtask_index);
        }
        Ok(())
    }

    /// Inject a barrier at the sources and wait until every given task
    /// aligned and handled it.
    pub async fn send_and_collect_barrier(
        &self,
        barrier: Barrier,
        collect_from: Vec<SubtaskIndex>,
    ) -> StreamResult<()> {
        let rx = {
            let mut barrier_manager = self.context.lock_barrier_manager();
            barrier_manager.send_barrier(&barrier, [SOURCE_TASK_ID], collect_from)?
        };
        rx.await
            .map_err(|_| StreamError::Internal(anyhow::anyhow!("barrier collection aborted")))?;
        Ok(())
    }

    fn task_handle(
        &self,
        subtask_index: SubtaskIndex,
    ) -> StreamResult<(Arc<Mutex<TaskCore<S>>>, Arc<Notify>)> {
        let tasks = self.tasks.lock();
        let handle = tasks
            .get(&subtask_index)
            .ok_or(StreamError::TaskNotFound(subtask_index))?;
        Ok((handle.core.clone(), handle.notify.clone()))
    }

    pub fn task_core(&self, subtask_index: SubtaskIndex) -> StreamResult<Arc<Mutex<TaskCore<S>>>> {
        Ok(self.task_handle(subtask_index)?.0)
    }

    /// One key group's state payload arrived at a destination. Applies it to
    /// the table, queues the drain and acknowledges to the coordinator.
    /// Duplicate deliveries of the same version are no-ops.
    pub fn on_dispatch_state(
        &self,
        subtask_index: SubtaskIndex,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        payload: Bytes,
    ) -> StreamResult<()> {
        let (core, notify) = self.task_handle(subtask_index)?;
        let mut core = core.lock();
        debug_assert_eq!(core.operator_id, operator_id);
        if !core.migration.on_state_arrived(kg, version) {
            debug!(kg = kg.as_u32(), version, "duplicate state delivery ignored");
            return Ok(());
        }

        let ingested = (|| -> StreamResult<()> {
            fail::fail_point!("ingest_state", |_| {
                Err(StreamError::Storage(StorageError::IngestFailure(
                    kg.as_u32(),
                    "failpoint".to_string(),
                )))
            });
            if !payload.is_empty() {
                core.state_table.ingest_frame(kg, &payload)?;
            }
            Ok(())
        })();

        match ingested {
            Ok(()) => {
                core.migration.mark_ready(kg);
                drop(core);
                notify.notify_one();
                let _ = self.coordinator().acknowledge_reconfig(
                    version,
                    subtask_index,
                    vec![(kg, KgStatus::Ingested)],
                );
                Ok(())
            }
            Err(e) => {
                warn!(kg = kg.as_u32(), err = %e, "state ingestion failed");
                drop(core);
                let _ = self.coordinator().acknowledge_reconfig(
                    version,
                    subtask_index,
                    vec![(kg, KgStatus::Failed(e.to_string()))],
                );
                Ok(())
            }
        }
    }

    /// A promote marker: ingest from the local replica store instead of a
    /// shipped payload.
    pub fn on_promote_replica(
        &self,
        subtask_index: SubtaskIndex,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        reconfig_id: ReconfigId,
    ) -> StreamResult<()> {
        let (core, notify) = self.task_handle(subtask_index)?;
        let mut core = core.lock();
        debug_assert_eq!(core.operator_id, operator_id);
        if !core.migration.on_state_arrived(kg, reconfig_id) {
            return Ok(());
        }

        match core.migration.take_replica(kg, version) {
            Some(payload) => {
                if !payload.is_empty() {
                    core.state_table.ingest_frame(kg, &payload)?;
                }
                core.migration.mark_ready(kg);
                info!(kg = kg.as_u32(), version, "replica promoted to live state");
                drop(core);
                notify.notify_one();
                let _ = self.coordinator().acknowledge_reconfig(
                    reconfig_id,
                    subtask_index,
                    vec![(kg, KgStatus::Ingested)],
                );
            }
            None => {
                drop(core);
                let _ = self.coordinator().acknowledge_reconfig(
                    reconfig_id,
                    subtask_index,
                    vec![(
                        kg,
                        KgStatus::Failed(format!("no replica at version {}", version)),
                    )],
                );
            }
        }
        Ok(())
    }

    /// Store a proactive replication delta on behalf of another task.
    pub fn on_dispatch_replica(
        &self,
        subtask_index: SubtaskIndex,
        kg: KeyGroup,
        version: u64,
        payload: Bytes,
    ) -> StreamResult<()> {
        let (core, _) = self.task_handle(subtask_index)?;
        core.lock().migration.store_replica(kg, version, payload);
        Ok(())
    }

    /// The coordinator allows a source to relinquish migrated-out groups.
    pub fn on_release_key_groups(
        &self,
        subtask_index: SubtaskIndex,
        reconfig_id: ReconfigId,
        kgs: Vec<KeyGroup>,
    ) -> StreamResult<()> {
        let (core, _) = self.task_handle(subtask_index)?;
        {
            let mut core = core.lock();
            core.state_table.release_changelogs(kgs.iter().copied());
            core.migration.on_released(&kgs);
            for kg in &kgs {
                core.range.remove(*kg);
            }
        }
        let _ = self.coordinator().acknowledge_reconfig(
            reconfig_id,
            subtask_index,
            kgs.into_iter()
                .map(|kg| (kg, KgStatus::SourceReleased))
                .collect(),
        );
        Ok(())
    }

    /// Reinitialize a task's ownership after a committed reconfiguration.
    pub fn on_dispatch_state_to_task(
        &self,
        subtask_index: SubtaskIndex,
        execution_id: ExecutionId,
        range: KeyGroupRange,
        id_in_model: IdInModel,
    ) -> StreamResult<()> {
        let (core, _) = self.task_handle(subtask_index)?;
        let mut core = core.lock();
        debug_assert_eq!(core.execution_id, execution_id);
        core.range.update(range);
        core.id_in_model = id_in_model;
        Ok(())
    }

    /// The reconfiguration committed; the task leaves migration mode.
    pub fn on_finish_reconfig(
        &self,
        subtask_index: SubtaskIndex,
        reconfig_id: ReconfigId,
    ) -> StreamResult<()> {
        let (core, notify) = self.task_handle(subtask_index)?;
        {
            let mut core = core.lock();
            if core.migration.reconfig_id() != Some(reconfig_id)
                && core.migration.in_migration()
            {
                warn!(
                    subtask_index,
                    reconfig_id, "finish notice for unexpected reconfig"
                );
            }
            let adopted = core.migration.finish();
            debug!(
                subtask_index,
                reconfig_id,
                adopted = adopted.len(),
                "task left migration mode"
            );
            core.load_stats.clear();
        }
        notify.notify_one();
        if let Ok(rewirer) = self.rewirer() {
            let _ = rewirer.seal_routing();
        }
        Ok(())
    }

    pub fn on_update_backup_key_groups(
        &self,
        subtask_index: SubtaskIndex,
        kgs: Vec<KeyGroup>,
    ) -> StreamResult<()> {
        let (core, _) = self.task_handle(subtask_index)?;
        core.lock().migration.set_backup_key_groups(kgs);
        Ok(())
    }

    /// Merged per-key-group record counts across tasks, for the planners.
    pub fn collect_load_stats(&self) -> HashMap<KeyGroup, u64> {
        let mut merged: HashMap<KeyGroup, u64> = HashMap::new();
        for handle in self.tasks.lock().values() {
            for (kg, count) in &handle.core.lock().load_stats {
                *merged.entry(*kg).or_default() += count;
            }
        }
        merged
    }

    pub fn subtask_indexes(&self) -> Vec<SubtaskIndex> {
        self.tasks.lock().keys().copied().collect()
    }
}

/// The source stage: merges externally fed records with injected barriers.
/// Barriers take priority so a reconfig-point never waits behind a deep
/// record backlog.
async fn run_source(
    mut record_rx: Receiver<Message>,
    mut barrier_rx: UnboundedReceiver<Message>,
    mut out: Sender<Message>,
) {
    use futures::SinkExt;
    loop {
        tokio::select! {
            biased;
            barrier = barrier_rx.recv() => match barrier {
                Some(message) => {
                    let stop = message.is_terminate();
                    if out.send(message).await.is_err() || stop {
                        break;
                    }
                }
                None => break,
            },
            record = record_rx.next() => match record {
                Some(message) => {
                    if out.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("source stage exited");
}

/// The partitioner stage: applies rewiring commands between messages and
/// routes everything else through the hash dispatcher.
async fn run_partitioner(
    mut input: Receiver<Message>,
    mut control_rx: UnboundedReceiver<DispatcherControl>,
    mut dispatcher: HashDataDispatcher,
) {
    loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => match control {
                Some(DispatcherControl::SubstituteOutput(slot, sender)) => {
                    if let Err(e) = dispatcher.substitute_output(slot, sender).await {
                        warn!(slot, err = %e, "failed to substitute output");
                    }
                }
                Some(DispatcherControl::RemoveOutput(slot)) => dispatcher.remove_output(slot),
                Some(DispatcherControl::SealRouting) => dispatcher.seal_routing(),
                None => break,
            },
            message = input.next() => match message {
                Some(message) => {
                    let stop = message.is_terminate();
                    if let Err(e) = dispatcher.dispatch(message).await {
                        warn!(err = %e, "partitioner failed to dispatch");
                        break;
                    }
                    if stop {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("partitioner stage exited");
}
