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
use futures::SinkExt;
use parking_lot::Mutex;
use spacker_common::config::SpackerConfig;
use spacker_common::hash::{KeyGroup, KeyGroupRange};
use spacker_common::types::{ExecutionId, IdInModel, OperatorId, ReconfigId, SubtaskIndex};
use spacker_meta::manager::{ReconfigBarrierInfo, StreamClientsRef};
use spacker_meta::model::JobExecutionPlan;
use spacker_meta::reconfig::{CoordinatorHandle, KgStatus};
use spacker_storage::{KeyGroupStateHandle, StateBackend, StateTable, StateTableSnapshot};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use super::{MigrationState, SharedContext};
use crate::error::{StreamError, StreamResult};
use crate::executor::{
    Barrier, BarrierKind, Executor, KeyedOperator, MergeExecutor, Message, StreamRecord,
};

/// Everything about one task that both the task loop and the control
/// handlers touch. Always accessed under the task lock.
pub struct TaskCore<S: StateBackend> {
    pub subtask_index: SubtaskIndex,
    pub execution_id: ExecutionId,
    pub id_in_model: IdInModel,
    pub operator_id: OperatorId,

    /// The key groups this task owns at the current epoch.
    pub range: KeyGroupRange,

    pub state_table: StateTable<S>,
    pub migration: MigrationState,

    /// Records processed per key group since the last reconfiguration,
    /// feeding the load-balance planners.
    pub load_stats: HashMap<KeyGroup, u64>,
}

/// Control commands applied by the task loop at a dispatch boundary, which
/// is the safe point for anything that touches the input gate or ends the
/// task.
pub enum TaskControl {
    /// Substitute the whole input gate (channel rewiring).
    UpdateInputs(Vec<Receiver<Message>>),
    /// Attach one more upstream channel.
    AddInput(Receiver<Message>),
    /// Cancel the task: exit at the next dispatch boundary.
    Stop,
}

/// The single-threaded record loop of one task.
///
/// Pulls records from the (merged, barrier-aligned) input gate and invokes
/// the keyed operator under the current key context. Migration adds three
/// concerns, checked in this order at every iteration:
/// drain-ready key groups first, then control commands, then the next
/// message.
pub struct InputProcessor<S: StateBackend> {
    core: Arc<Mutex<TaskCore<S>>>,
    input: MergeExecutor,
    operator: Box<dyn KeyedOperator<S>>,
    output: Sender<Message>,
    control_rx: UnboundedReceiver<TaskControl>,

    /// Signaled by the control handlers when a drain became possible.
    notify: Arc<Notify>,

    ctx: Arc<SharedContext>,
    coordinator: CoordinatorHandle,
    clients: StreamClientsRef,
    config: Arc<SpackerConfig>,
}

impl<S: StateBackend> InputProcessor<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: Arc<Mutex<TaskCore<S>>>,
        input: MergeExecutor,
        operator: Box<dyn KeyedOperator<S>>,
        output: Sender<Message>,
        control_rx: UnboundedReceiver<TaskControl>,
        notify: Arc<Notify>,
        ctx: Arc<SharedContext>,
        coordinator: CoordinatorHandle,
        clients: StreamClientsRef,
        config: Arc<SpackerConfig>,
    ) -> Self {
        Self {
            core,
            input,
            operator,
            output,
            control_rx,
            notify,
            ctx,
            coordinator,
            clients,
            config,
        }
    }

    pub async fn run(mut self) -> StreamResult<()> {
        enum Event {
            Control(Option<TaskControl>),
            DrainReady,
            Message(StreamResult<Message>),
        }

        let subtask_index = self.core.lock().subtask_index;
        debug!(subtask_index, "input processor started");
        loop {
            self.drain_ready().await?;

            let event = {
                let notify = self.notify.clone();
                tokio::select! {
                    biased;
                    control = self.control_rx.recv() => Event::Control(control),
                    _ = notify.notified() => Event::DrainReady,
                    message = self.input.next() => Event::Message(message),
                }
            };
            match event {
                Event::Control(None) | Event::Control(Some(TaskControl::Stop)) => break,
                Event::Control(Some(control)) => self.handle_control(control)?,
                // Loop around and re-check pending drains.
                Event::DrainReady => {}
                Event::Message(message) => {
                    if !self.handle_message(message?).await? {
                        break;
                    }
                }
            }
        }
        debug!(subtask_index, "input processor exited");
        Ok(())
    }

    fn handle_control(&mut self, control: TaskControl) -> StreamResult<()> {
        match control {
            TaskControl::UpdateInputs(inputs) => self.input.update_inputs(inputs),
            TaskControl::AddInput(input) => self.input.add_input(input),
            TaskControl::Stop => unreachable!("handled by the caller"),
        }
    }

    async fn handle_message(&mut self, message: Message) -> StreamResult<bool> {
        match message {
            Message::Record(record) => {
                self.handle_record(record).await?;
                Ok(true)
            }
            Message::Barrier(barrier) => self.handle_barrier(barrier).await,
        }
    }

    async fn handle_record(&mut self, record: StreamRecord) -> StreamResult<()> {
        let output = {
            let mut core = self.core.lock();
            let kg = record.key_group(core.state_table.max_parallelism());

            if core.migration.should_buffer(kg) {
                // Destination rule: the group's state is still in flight.
                core.migration.buffer_record(kg, record);
                return Ok(());
            }
            if core.migration.is_outgoing(kg) {
                // Source rule: acknowledged but not processed locally; the
                // partitioner re-emits to the new owner after rewiring.
                trace!(kg = kg.as_u32(), "record for outgoing group suppressed");
                return Ok(());
            }
            if !core.range.contains(kg) && !core.migration.is_adopted(kg) {
                warn!(
                    kg = kg.as_u32(),
                    subtask = core.subtask_index,
                    "record for unowned key group dropped"
                );
                return Ok(());
            }

            Self::invoke_operator(&mut core, self.operator.as_mut(), &record)?
        };

        if let Some(out) = output {
            self.output
                .send(Message::Record(out))
                .await
                .map_err(|_| StreamError::ChannelClosed)?;
        }
        Ok(())
    }

    fn invoke_operator(
        core: &mut TaskCore<S>,
        operator: &mut dyn KeyedOperator<S>,
        record: &StreamRecord,
    ) -> StreamResult<Option<StreamRecord>> {
        core.state_table.set_current_key(&record.key);
        let kg = core
            .state_table
            .current_key_group()
            .expect("key context just set");
        *core.load_stats.entry(kg).or_default() += 1;
        operator.process(record, &mut core.state_table)
    }

    /// Drain buffered records of every key group whose state arrived. Each
    /// group drains atomically with respect to the operator: the task lock is
    /// held for the whole per-group queue, so no other record interleaves.
    async fn drain_ready(&mut self) -> StreamResult<()> {
        loop {
            let mut outputs = Vec::new();
            let drained = {
                let mut core = self.core.lock();
                let Some((kg, records)) = core.migration.next_drain() else {
                    return Ok(());
                };
                trace!(
                    kg = kg.as_u32(),
                    records = records.len(),
                    "draining migrated key group"
                );
                for record in &records {
                    if let Some(out) =
                        Self::invoke_operator(&mut core, self.operator.as_mut(), record)?
                    {
                        outputs.push(out);
                    }
                }
                (kg, core.migration.reconfig_id(), core.subtask_index)
            };

            for out in outputs {
                self.output
                    .send(Message::Record(out))
                    .await
                    .map_err(|_| StreamError::ChannelClosed)?;
            }

            let (kg, reconfig_id, subtask_index) = drained;
            if let Some(reconfig_id) = reconfig_id {
                let _ = self.coordinator.acknowledge_reconfig(
                    reconfig_id,
                    subtask_index,
                    vec![(kg, KgStatus::Drained)],
                );
            }
        }
    }

    async fn handle_barrier(&mut self, barrier: Barrier) -> StreamResult<bool> {
        let keep_running = match barrier.kind.clone() {
            BarrierKind::Checkpoint => true,
            BarrierKind::Stop => false,
            BarrierKind::ReconfigPoint(info) => {
                self.on_reconfig_point(&info)?;
                true
            }
            BarrierKind::Cancel(reconfig_id) => {
                self.on_cancel(reconfig_id);
                true
            }
        };

        // Forward downstream before reporting, like any aligned barrier.
        self.output
            .send(Message::Barrier(barrier.clone()))
            .await
            .map_err(|_| StreamError::ChannelClosed)?;

        let subtask_index = self.core.lock().subtask_index;
        self.ctx
            .lock_barrier_manager()
            .collect(subtask_index, &barrier);
        Ok(keep_running)
    }

    /// The task side of §reconfig trigger: enter migration mode and, as a
    /// source, run the affected snapshot. The synchronous phase captures the
    /// migrating groups under the task lock; serialization and transfer run
    /// off the task thread.
    fn on_reconfig_point(&mut self, info: &Arc<ReconfigBarrierInfo>) -> StreamResult<()> {
        let (snapshot, transfer) = {
            let mut core = self.core.lock();
            let slot = core.subtask_index;
            let src = info.plan.source_kgs(slot).to_vec();
            let dst = info.plan.destination_kgs(slot).to_vec();
            debug_assert_eq!(info.plan.digest(), info.plan_digest);

            core.migration.begin(
                info.reconfig_id,
                src.iter().copied(),
                dst.iter().copied(),
                info.order_function,
            );
            // A payload that raced ahead of this barrier is already ingested.
            for kg in dst {
                if core.migration.has_arrived(kg, info.reconfig_id) {
                    core.migration.mark_ready(kg);
                }
            }

            if src.is_empty() {
                (None, None)
            } else {
                debug!(
                    subtask = slot,
                    groups = src.len(),
                    reconfig_id = info.reconfig_id,
                    "taking affected-state snapshot"
                );
                let snapshot: Result<StateTableSnapshot, spacker_storage::StorageError> = (|| {
                    fail::fail_point!("affected_snapshot", |_| {
                        Err(spacker_storage::StorageError::SnapshotFailure(
                            src[0].as_u32(),
                            "failpoint".to_string(),
                        ))
                    });
                    Ok(core.state_table.snapshot(src.iter().copied()))
                })();
                let snapshot = match snapshot {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        // The reconfig aborts; state stays at this source.
                        let _ = self.coordinator.decline_reconfig(
                            info.reconfig_id,
                            slot,
                            e.to_string(),
                        );
                        return Ok(());
                    }
                };
                let replicated: HashMap<KeyGroup, u64> = src
                    .iter()
                    .filter_map(|&kg| {
                        core.migration.replicated_version(kg).map(|v| (kg, v))
                    })
                    .collect();
                (Some(snapshot), Some((src, replicated, slot)))
            }
        };

        if let (Some(snapshot), Some((src, replicated, slot))) = (snapshot, transfer) {
            let task = TransferTask {
                reconfig_id: info.reconfig_id,
                operator_id: self.core.lock().operator_id,
                slot,
                plan: info.plan.clone(),
                src,
                replicated,
                clients: self.clients.clone(),
                coordinator: self.coordinator.clone(),
                config: self.config.clone(),
            };
            if self.config.state_backend.async_snapshot {
                tokio::spawn(task.run_from_snapshot(snapshot));
            } else {
                // Serialize on the task thread before processing resumes;
                // only the transfer itself leaves the critical path.
                let handle = snapshot.into_handle();
                tokio::spawn(task.run(handle));
            }
        }
        Ok(())
    }

    fn on_cancel(&mut self, reconfig_id: ReconfigId) {
        let mut core = self.core.lock();
        if core.migration.reconfig_id() != Some(reconfig_id) {
            return;
        }
        warn!(
            subtask = core.subtask_index,
            reconfig_id, "reconfig cancelled, reverting to previous plan"
        );
        let partial = core.migration.cancel();
        // Partially ingested state goes back to limbo; the source still owns
        // these groups under the old plan.
        core.state_table.release_changelogs(partial);
        core.load_stats.clear();
    }
}

/// The asynchronous phase of a source's affected snapshot: serialize the
/// captured groups and push each one to its destination, or a promote marker
/// where the destination's replica is already fresh.
struct TransferTask {
    reconfig_id: ReconfigId,
    operator_id: OperatorId,
    slot: SubtaskIndex,
    plan: Arc<JobExecutionPlan>,
    src: Vec<KeyGroup>,
    /// Replica versions this source shipped before the reconfig; a group
    /// whose snapshot is unmodified since then skips the payload.
    replicated: HashMap<KeyGroup, u64>,
    clients: StreamClientsRef,
    coordinator: CoordinatorHandle,
    config: Arc<SpackerConfig>,
}

impl TransferTask {
    async fn run_from_snapshot(self, snapshot: StateTableSnapshot) {
        let handle = snapshot.into_handle();
        self.run(handle).await
    }

    async fn run(self, handle: KeyGroupStateHandle) {
        if let Err(e) = self.run_inner(handle).await {
            error!(
                reconfig_id = self.reconfig_id,
                slot = self.slot,
                err = %e,
                "state transfer failed, declining reconfig"
            );
            let _ = self.coordinator.decline_reconfig(
                self.reconfig_id,
                self.slot,
                e.to_string(),
            );
        }
    }

    async fn run_inner(&self, handle: KeyGroupStateHandle) -> StreamResult<()> {
        self.coordinator.acknowledge_reconfig(
            self.reconfig_id,
            self.slot,
            self.src
                .iter()
                .map(|&kg| (kg, KgStatus::SnapshotTaken))
                .collect(),
        )?;

        // The handle is decomposed into per-group frames; the summary (just
        // offsets, no payload) is all the coordinator ever sees of it.
        let fresh: HashMap<KeyGroup, u64> = self
            .src
            .iter()
            .filter_map(|&kg| {
                let version = *self.replicated.get(&kg)?;
                match handle.is_modified(kg) {
                    Ok(false) => Some((kg, version)),
                    _ => None,
                }
            })
            .collect();
        let mut frames: HashMap<KeyGroup, Bytes> = handle.decompose()?.into_iter().collect();

        let batch_size = if self.config.reconfig.sync_keys == 0 {
            self.src.len().max(1)
        } else {
            self.config.reconfig.sync_keys
        };

        for batch in self.src.chunks(batch_size) {
            let mut statuses = Vec::with_capacity(batch.len());
            for &kg in batch {
                let addr = self.plan.destination_of(kg).ok_or_else(|| {
                    StreamError::RewireFailure(format!("{} has no destination", kg))
                })?;
                let client = self.clients.get(addr.subtask_index)?;

                if let Some(&version) = fresh.get(&kg) {
                    client
                        .promote_replica(self.operator_id, kg, version, self.reconfig_id)
                        .await?;
                    trace!(kg = kg.as_u32(), version, "replica promoted instead of payload");
                    statuses.push((kg, KgStatus::ReplicaPromoted));
                    continue;
                }

                // An empty group still ships an empty payload so the
                // destination knows the transfer is complete.
                let payload = frames.remove(&kg).unwrap_or_default();
                let mut attempts = 0;
                loop {
                    match client
                        .dispatch_state(self.operator_id, kg, self.reconfig_id, payload.clone())
                        .await
                    {
                        Ok(()) => break,
                        Err(e) => {
                            attempts += 1;
                            if attempts > self.config.reconfig.max_transfer_retries {
                                return Err(e.into());
                            }
                            warn!(
                                kg = kg.as_u32(),
                                attempts,
                                err = %e,
                                "state dispatch failed, retrying"
                            );
                        }
                    }
                }
                statuses.push((kg, KgStatus::Transferred));
            }
            self.coordinator
                .acknowledge_reconfig(self.reconfig_id, self.slot, statuses)?;
        }
        Ok(())
    }
}
