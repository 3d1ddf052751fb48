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

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spacker_common::config::SpackerConfig;
use spacker_common::hash::KeyGroup;
use spacker_common::types::{OperatorId, ReconfigId, SubtaskIndex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{plan_assignment, KgStatus, ReconfigRequest};
use crate::error::{MetaError, MetaResult};
use crate::manager::{BarrierInjector, ReconfigBarrierInfo, StreamClientsRef};
use crate::model::{JobExecutionPlan, LogicalAssignment};

/// Phases of the reconfig-point protocol. The coordinator rejects new
/// requests unless idle, so at most one reconfiguration is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoordinatorState {
    Idle,
    Triggered,
    Snapshotting,
    Transferring,
    Draining,
    Committed,
}

impl CoordinatorState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Triggered => "triggered",
            Self::Snapshotting => "snapshotting",
            Self::Transferring => "transferring",
            Self::Draining => "draining",
            Self::Committed => "committed",
        }
    }
}

/// Snapshot of coordinator health for inspection.
#[derive(Clone, Debug)]
pub struct CoordinatorStatus {
    pub state: &'static str,
    pub reconfig_id: ReconfigId,
    pub unacked_subtasks: Vec<SubtaskIndex>,
    /// Whether the last commit was cut short by the transfer timeout.
    pub partial: bool,
}

enum CoordinatorMessage {
    Submit {
        request: ReconfigRequest,
        result_tx: oneshot::Sender<MetaResult<ReconfigId>>,
    },
    Ack {
        reconfig_id: ReconfigId,
        subtask_index: SubtaskIndex,
        per_kg_status: Vec<(KeyGroup, KgStatus)>,
    },
    Decline {
        reconfig_id: ReconfigId,
        subtask_index: SubtaskIndex,
        cause: String,
    },
    Status {
        result_tx: oneshot::Sender<CoordinatorStatus>,
    },
    CurrentPlan {
        result_tx: oneshot::Sender<Arc<JobExecutionPlan>>,
    },
    UpdateBackup {
        subtask_index: SubtaskIndex,
        operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
        result_tx: oneshot::Sender<MetaResult<()>>,
    },
}

/// Cloneable handle to the coordinator actor. Tasks report progress through
/// it; operators of the engine submit migration requests through it.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// Run one full reconfiguration; resolves once it committed or aborted.
    pub async fn submit(&self, request: ReconfigRequest) -> MetaResult<ReconfigId> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(CoordinatorMessage::Submit { request, result_tx })?;
        result_rx
            .await
            .map_err(|_| MetaError::Internal(anyhow::anyhow!("coordinator stopped")))?
    }

    pub fn acknowledge_reconfig(
        &self,
        reconfig_id: ReconfigId,
        subtask_index: SubtaskIndex,
        per_kg_status: Vec<(KeyGroup, KgStatus)>,
    ) -> MetaResult<()> {
        self.send(CoordinatorMessage::Ack {
            reconfig_id,
            subtask_index,
            per_kg_status,
        })
    }

    pub fn decline_reconfig(
        &self,
        reconfig_id: ReconfigId,
        subtask_index: SubtaskIndex,
        cause: String,
    ) -> MetaResult<()> {
        self.send(CoordinatorMessage::Decline {
            reconfig_id,
            subtask_index,
            cause,
        })
    }

    pub async fn status(&self) -> MetaResult<CoordinatorStatus> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(CoordinatorMessage::Status { result_tx })?;
        result_rx
            .await
            .map_err(|_| MetaError::Internal(anyhow::anyhow!("coordinator stopped")))
    }

    pub async fn current_plan(&self) -> MetaResult<Arc<JobExecutionPlan>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(CoordinatorMessage::CurrentPlan { result_tx })?;
        result_rx
            .await
            .map_err(|_| MetaError::Internal(anyhow::anyhow!("coordinator stopped")))
    }

    /// Point proactive replication of a subtask at the given key groups.
    pub async fn update_backup_key_groups(
        &self,
        subtask_index: SubtaskIndex,
        operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
    ) -> MetaResult<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(CoordinatorMessage::UpdateBackup {
            subtask_index,
            operator_id,
            kgs,
            result_tx,
        })?;
        result_rx
            .await
            .map_err(|_| MetaError::Internal(anyhow::anyhow!("coordinator stopped")))?
    }

    fn send(&self, msg: CoordinatorMessage) -> MetaResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| MetaError::Internal(anyhow::anyhow!("coordinator stopped")))
    }
}

/// Bookkeeping for the reconfiguration in flight.
struct Inflight {
    reconfig_id: ReconfigId,
    operator_id: OperatorId,
    prev_plan: Arc<JobExecutionPlan>,
    plan: Arc<JobExecutionPlan>,
    migrating: HashSet<KeyGroup>,
    snapshotted: HashSet<KeyGroup>,
    transferred: HashSet<KeyGroup>,
    ingested: HashSet<KeyGroup>,
    released: HashSet<KeyGroup>,
    /// Whether sources were already told to release. Releases start only
    /// once every group is ingested, so an abort never leaves state solely
    /// at the destinations.
    release_requested: bool,
    deadline: Option<Instant>,
    result_tx: oneshot::Sender<MetaResult<ReconfigId>>,
}

/// Singleton per job. Owns the authoritative execution plan and drives
/// reconfig-points end to end: trigger, affected snapshot, transfer, drain,
/// commit or abort.
pub struct ReconfigCoordinator {
    config: SpackerConfig,
    clients: StreamClientsRef,
    injector: Arc<dyn BarrierInjector>,
    current_plan: Arc<JobExecutionPlan>,
    state: CoordinatorState,
    next_reconfig_id: ReconfigId,
    last_reconfig_id: ReconfigId,
    last_partial: bool,
    inflight: Option<Inflight>,
    rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
}

impl ReconfigCoordinator {
    /// Spawn the coordinator actor and return its handle.
    pub fn start(
        config: SpackerConfig,
        clients: StreamClientsRef,
        injector: Arc<dyn BarrierInjector>,
        initial_plan: JobExecutionPlan,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            config,
            clients,
            injector,
            current_plan: Arc::new(initial_plan),
            state: CoordinatorState::Idle,
            next_reconfig_id: 1,
            last_reconfig_id: 0,
            last_partial: false,
            inflight: None,
            rx,
        };
        let join = tokio::spawn(coordinator.run());
        (CoordinatorHandle { tx }, join)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.inflight.as_ref().and_then(|i| i.deadline);
            let msg = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        msg = self.rx.recv() => msg,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.on_transfer_timeout().await;
                            continue;
                        }
                    }
                }
                None => self.rx.recv().await,
            };
            let Some(msg) = msg else {
                debug!("all coordinator handles dropped, exiting");
                break;
            };
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: CoordinatorMessage) {
        match msg {
            CoordinatorMessage::Submit { request, result_tx } => {
                if self.state != CoordinatorState::Idle {
                    let _ = result_tx.send(Err(MetaError::NotIdle(self.state.name())));
                    return;
                }
                self.trigger(request, result_tx).await;
            }
            CoordinatorMessage::Ack {
                reconfig_id,
                subtask_index,
                per_kg_status,
            } => {
                self.on_ack(reconfig_id, subtask_index, per_kg_status).await;
            }
            CoordinatorMessage::Decline {
                reconfig_id,
                subtask_index,
                cause,
            } => {
                self.on_decline(reconfig_id, subtask_index, cause).await;
            }
            CoordinatorMessage::Status { result_tx } => {
                let _ = result_tx.send(self.status());
            }
            CoordinatorMessage::CurrentPlan { result_tx } => {
                let _ = result_tx.send(self.current_plan.clone());
            }
            CoordinatorMessage::UpdateBackup {
                subtask_index,
                operator_id,
                kgs,
                result_tx,
            } => {
                let result = self.update_backup(subtask_index, operator_id, kgs).await;
                let _ = result_tx.send(result);
            }
        }
    }

    fn status(&self) -> CoordinatorStatus {
        let unacked = match &self.inflight {
            None => vec![],
            Some(inflight) => inflight
                .plan
                .modified_subtasks()
                .iter()
                .copied()
                .filter(|&slot| {
                    let src_pending = inflight
                        .plan
                        .source_kgs(slot)
                        .iter()
                        .any(|kg| !inflight.released.contains(kg));
                    let dst_pending = inflight
                        .plan
                        .destination_kgs(slot)
                        .iter()
                        .any(|kg| !inflight.ingested.contains(kg));
                    src_pending || dst_pending
                })
                .collect(),
        };
        CoordinatorStatus {
            state: self.state.name(),
            reconfig_id: self
                .inflight
                .as_ref()
                .map(|i| i.reconfig_id)
                .unwrap_or(self.last_reconfig_id),
            unacked_subtasks: unacked,
            partial: self.last_partial,
        }
    }

    async fn update_backup(
        &self,
        subtask_index: SubtaskIndex,
        operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
    ) -> MetaResult<()> {
        let execution_id = self.clients.execution_id(subtask_index)?;
        self.clients
            .get(subtask_index)?
            .update_backup_key_groups(execution_id, operator_id, kgs)
            .await
    }

    /// Step 1 of the protocol: validate the request into a plan and inject
    /// the reconfig-point barrier.
    async fn trigger(
        &mut self,
        request: ReconfigRequest,
        result_tx: oneshot::Sender<MetaResult<ReconfigId>>,
    ) {
        let targets = self.config.target_operator_names();
        if !targets.is_empty() && !targets.contains(&request.operator_name.as_str()) {
            let _ = result_tx.send(Err(MetaError::InvalidPlan(format!(
                "operator {:?} is not a reconfig target",
                request.operator_name
            ))));
            return;
        }

        let assignment = match plan_assignment(&self.config.reconfig, &self.current_plan, &request)
        {
            Ok(assignment) => assignment,
            Err(e) => {
                let _ = result_tx.send(Err(e));
                return;
            }
        };
        let plan = match JobExecutionPlan::derive(&self.current_plan, &assignment) {
            Ok(plan) => Arc::new(plan),
            Err(e) => {
                let _ = result_tx.send(Err(e));
                return;
            }
        };

        let migrating: HashSet<KeyGroup> = plan.migrating_key_groups().collect();
        let reconfig_id = self.next_reconfig_id;
        self.next_reconfig_id += 1;

        if migrating.is_empty() {
            // Nothing moves; adopt the plan without a barrier round.
            self.current_plan = plan;
            self.last_reconfig_id = reconfig_id;
            let _ = result_tx.send(Ok(reconfig_id));
            return;
        }

        info!(
            reconfig_id,
            migrating = migrating.len(),
            subtasks = ?plan.modified_subtasks(),
            "triggering reconfig-point"
        );
        self.state = CoordinatorState::Triggered;
        self.inflight = Some(Inflight {
            reconfig_id,
            operator_id: request.operator_id,
            prev_plan: self.current_plan.clone(),
            plan: plan.clone(),
            migrating,
            snapshotted: HashSet::new(),
            transferred: HashSet::new(),
            ingested: HashSet::new(),
            released: HashSet::new(),
            release_requested: false,
            deadline: None,
            result_tx,
        });

        let info = ReconfigBarrierInfo {
            reconfig_id,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            plan_digest: plan.digest(),
            plan,
            order_function: self.config.reconfig.order_function,
        };
        match self.injector.inject_reconfig_barrier(info).await {
            Ok(()) => {
                self.state = CoordinatorState::Snapshotting;
            }
            Err(e) => {
                self.abort(format!("barrier injection failed: {}", e)).await;
            }
        }
    }

    async fn on_ack(
        &mut self,
        reconfig_id: ReconfigId,
        subtask_index: SubtaskIndex,
        per_kg_status: Vec<(KeyGroup, KgStatus)>,
    ) {
        let Some(inflight) = &mut self.inflight else {
            warn!(reconfig_id, subtask_index, "ack without inflight reconfig");
            return;
        };
        if inflight.reconfig_id != reconfig_id {
            // Stale ack from an aborted attempt; reconfig ids only grow.
            warn!(
                reconfig_id,
                current = inflight.reconfig_id,
                "dropping ack for stale reconfig"
            );
            return;
        }

        let mut failure: Option<(Option<KeyGroup>, String)> = None;
        for (kg, status) in per_kg_status {
            match status {
                KgStatus::SnapshotTaken => {
                    inflight.snapshotted.insert(kg);
                }
                KgStatus::Transferred | KgStatus::ReplicaPromoted => {
                    inflight.transferred.insert(kg);
                }
                KgStatus::Ingested => {
                    inflight.ingested.insert(kg);
                }
                KgStatus::Drained => {
                    // Informational: tracked implicitly by task-side state.
                }
                KgStatus::SourceReleased => {
                    inflight.released.insert(kg);
                }
                KgStatus::Failed(cause) => {
                    failure = Some((Some(kg), cause));
                }
            }
        }

        if let Some((kg, cause)) = failure {
            let cause = match kg {
                Some(kg) => format!("key group {} failed: {}", kg, cause),
                None => cause,
            };
            self.abort(cause).await;
            return;
        }

        self.advance_state();

        // Once every group is ingested, sources may release: from here on an
        // abort can no longer strand state at the destinations only.
        let (reconfig_id, operator_id, by_source) = {
            let inflight = self.inflight.as_mut().unwrap();
            let mut by_source: BTreeMap<SubtaskIndex, Vec<KeyGroup>> = BTreeMap::new();
            if !inflight.release_requested
                && inflight.ingested.len() == inflight.migrating.len()
            {
                inflight.release_requested = true;
                for &kg in &inflight.migrating {
                    if let Some(slot) = inflight.prev_plan.owner_of(kg) {
                        by_source.entry(slot).or_default().push(kg);
                    }
                }
            }
            (inflight.reconfig_id, inflight.operator_id, by_source)
        };
        for (slot, kgs) in by_source {
            match self.clients.get(slot) {
                Ok(client) => {
                    if let Err(e) = client.release_key_groups(reconfig_id, operator_id, kgs).await {
                        self.abort(format!("source {} failed to release: {}", slot, e))
                            .await;
                        return;
                    }
                }
                Err(e) => {
                    self.abort(format!("source {} unreachable: {}", slot, e)).await;
                    return;
                }
            }
        }

        self.maybe_commit().await;
    }

    /// Move the FSM forward from the accumulated per-group progress.
    fn advance_state(&mut self) {
        let Some(inflight) = &mut self.inflight else {
            return;
        };
        if self.state == CoordinatorState::Snapshotting
            && inflight.snapshotted.len() == inflight.migrating.len()
        {
            self.state = CoordinatorState::Transferring;
            inflight.deadline = Some(
                Instant::now() + Duration::from_millis(self.config.reconfig.timeout_ms),
            );
        }
        if self.state == CoordinatorState::Transferring
            && inflight.transferred.len() == inflight.migrating.len()
        {
            self.state = CoordinatorState::Draining;
        }
    }

    /// Step 6: commit once every migrating group is ingested at its
    /// destination and every source released its changelog entries.
    async fn maybe_commit(&mut self) {
        let done = match &self.inflight {
            Some(inflight) => {
                inflight.ingested.len() == inflight.migrating.len()
                    && inflight.released.len() == inflight.migrating.len()
            }
            None => false,
        };
        if !done {
            return;
        }
        self.commit(false).await;
    }

    async fn commit(&mut self, partial: bool) {
        let inflight = self.inflight.take().expect("commit without inflight");
        self.state = CoordinatorState::Committed;

        let committed_plan = if partial {
            match self.partial_plan(&inflight) {
                Ok(plan) => plan,
                Err(e) => {
                    self.inflight = Some(inflight);
                    self.abort(format!("partial commit failed: {}", e)).await;
                    return;
                }
            }
        } else {
            inflight.plan.clone()
        };

        // Reinitialize ownership on every modified subtask, then let tasks
        // leave migration mode.
        for &slot in committed_plan.modified_subtasks() {
            let result = async {
                let execution_id = self.clients.execution_id(slot)?;
                self.clients
                    .get(slot)?
                    .dispatch_state_to_task(
                        execution_id,
                        inflight.operator_id,
                        committed_plan.aligned_range(slot).clone(),
                        committed_plan.id_in_model(slot),
                    )
                    .await
            }
            .await;
            if let Err(e) = result {
                warn!(slot, err = %e, "failed to reinitialize ownership on commit");
            }
        }
        for slot in self.clients.subtask_indexes() {
            if let Ok(client) = self.clients.get(slot) {
                if let Err(e) = client.finish_reconfig(inflight.reconfig_id).await {
                    warn!(slot, err = %e, "failed to notify reconfig completion");
                }
            }
        }

        info!(
            reconfig_id = inflight.reconfig_id,
            partial, "reconfig-point committed"
        );
        self.current_plan = committed_plan;
        self.last_reconfig_id = inflight.reconfig_id;
        self.last_partial = partial;
        self.state = CoordinatorState::Idle;
        let _ = inflight.result_tx.send(Ok(inflight.reconfig_id));
    }

    /// The assignment actually achieved when the transfer timed out: groups
    /// that never arrived stay with their previous owner.
    fn partial_plan(&self, inflight: &Inflight) -> MetaResult<Arc<JobExecutionPlan>> {
        let mut assignment: LogicalAssignment = inflight
            .plan
            .occupied_slots()
            .map(|slot| {
                (
                    inflight.plan.id_in_model(slot),
                    inflight.plan.assignment(slot).to_vec(),
                )
            })
            .collect();

        for &kg in inflight.migrating.difference(&inflight.ingested) {
            let old_owner = inflight
                .prev_plan
                .owner_of(kg)
                .ok_or_else(|| MetaError::InvalidPlan(format!("{} has no previous owner", kg)))?;
            let old_id = inflight.prev_plan.id_in_model(old_owner);
            for kgs in assignment.values_mut() {
                kgs.retain(|&candidate| candidate != kg);
            }
            assignment
                .entry(old_id)
                .or_default()
                .push(kg);
        }

        Ok(Arc::new(JobExecutionPlan::derive(
            &inflight.prev_plan,
            &assignment,
        )?))
    }

    async fn on_decline(
        &mut self,
        reconfig_id: ReconfigId,
        subtask_index: SubtaskIndex,
        cause: String,
    ) {
        match &self.inflight {
            Some(inflight) if inflight.reconfig_id == reconfig_id => {
                self.abort(format!("subtask {} declined: {}", subtask_index, cause))
                    .await;
            }
            _ => {
                warn!(reconfig_id, subtask_index, "dropping stale decline");
            }
        }
    }

    /// Abort the in-flight reconfiguration: broadcast cancel markers, keep
    /// the old plan authoritative. A retry arrives under a fresh id.
    async fn abort(&mut self, cause: String) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        warn!(
            reconfig_id = inflight.reconfig_id,
            cause = %cause,
            "aborting reconfig-point"
        );
        if let Err(e) = self.injector.inject_cancel(inflight.reconfig_id).await {
            warn!(err = %e, "failed to broadcast cancel marker");
        }
        self.state = CoordinatorState::Idle;
        self.last_reconfig_id = inflight.reconfig_id;
        self.last_partial = false;
        let _ = inflight
            .result_tx
            .send(Err(MetaError::Aborted(inflight.reconfig_id, cause)));
    }

    async fn on_transfer_timeout(&mut self) {
        let Some(inflight) = &mut self.inflight else {
            return;
        };
        inflight.deadline = None;
        let missing = inflight.migrating.len() - inflight.ingested.len();
        if self.config.reconfig.allow_partial {
            warn!(
                reconfig_id = inflight.reconfig_id,
                missing, "transfer timed out, committing partially"
            );
            self.commit(true).await;
        } else {
            self.abort(format!("transfer timed out with {} groups missing", missing))
                .await;
        }
    }
}
