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

use std::collections::{HashMap, HashSet};

use spacker_common::types::{Epoch, ReconfigId};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{StreamError, StreamResult};
use crate::executor::{Barrier, BarrierKind, Message};

/// Which reconfiguration a barrier belongs to, if any. Checkpoints carry
/// none; reconfig-points and their cancel markers carry the id the
/// coordinator stamped.
fn reconfig_id_of(barrier: &Barrier) -> Option<ReconfigId> {
    match &barrier.kind {
        BarrierKind::ReconfigPoint(info) => Some(info.reconfig_id),
        BarrierKind::Cancel(reconfig_id) => Some(*reconfig_id),
        BarrierKind::Checkpoint | BarrierKind::Stop => None,
    }
}

/// One barrier round in flight: the tasks that still have to report, keyed
/// by the epoch *and* the reconfiguration the barrier belongs to.
struct CollectionRound {
    epoch: Epoch,
    reconfig_id: Option<ReconfigId>,

    /// Task ids that have not reported yet.
    remaining_tasks: HashSet<u32>,

    /// Fires once the last task reported.
    collect_notifier: oneshot::Sender<()>,
}

impl CollectionRound {
    /// A report only counts if it is for this very round. An ack left over
    /// from an aborted reconfiguration has the wrong `reconfig_id` (or a
    /// wrong epoch) and must not be allowed to satisfy the round that
    /// replaced it.
    fn matches(&self, barrier: &Barrier) -> bool {
        self.epoch == barrier.epoch && self.reconfig_id == reconfig_id_of(barrier)
    }
}

/// Serves barrier injection on one node: pushes the barrier into the
/// registered injection points (the record sources), tracks which tasks have
/// aligned and handled it, and notifies the injector when the round is
/// complete.
///
/// Rounds are strictly sequential. The coordinator rejects overlapping
/// reconfigurations and awaits collection before acting on the outcome, so
/// opening a round while another is still collecting is a protocol bug and
/// panics.
pub struct LocalBarrierManager {
    /// Barrier-injection senders, keyed by the pseudo task id of the source.
    senders: HashMap<u32, UnboundedSender<Message>>,

    round: Option<CollectionRound>,

    /// Epoch of the last completed round, kept for diagnostics.
    last_epoch: Option<Epoch>,
}

impl Default for LocalBarrierManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBarrierManager {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
            round: None,
            last_epoch: None,
        }
    }

    /// Register an injection point. Barriers sent afterwards enter the
    /// stream through it.
    pub fn register_sender(&mut self, task_id: u32, sender: UnboundedSender<Message>) {
        debug!(task_id, "barrier injection point registered");
        self.senders.insert(task_id, sender);
    }

    /// Open a collection round and push the barrier into every requested
    /// injection point. The returned receiver fires once all tasks in
    /// `task_ids_to_collect` reported the barrier back.
    pub fn send_barrier(
        &mut self,
        barrier: &Barrier,
        task_ids_to_send: impl IntoIterator<Item = u32>,
        task_ids_to_collect: impl IntoIterator<Item = u32>,
    ) -> StreamResult<oneshot::Receiver<()>> {
        let to_collect: HashSet<u32> = task_ids_to_collect.into_iter().collect();
        assert!(
            self.round.is_none(),
            "barrier round for epoch {} still collecting",
            self.round.as_ref().map(|r| r.epoch).unwrap_or_default(),
        );
        assert!(!to_collect.is_empty());

        let (tx, rx) = oneshot::channel();
        self.round = Some(CollectionRound {
            epoch: barrier.epoch,
            reconfig_id: reconfig_id_of(barrier),
            remaining_tasks: to_collect,
            collect_notifier: tx,
        });

        for task_id in task_ids_to_send {
            let sender = self.senders.get(&task_id).unwrap_or_else(|| {
                panic!("no injection point registered for task {}", task_id)
            });
            sender
                .send(Message::Barrier(barrier.clone()))
                .map_err(|_| StreamError::ChannelClosed)?;
        }
        trace!(
            epoch = barrier.epoch,
            reconfig_id = ?reconfig_id_of(barrier),
            "barrier round opened"
        );

        Ok(rx)
    }

    /// A task aligned and handled a barrier; count it towards the open
    /// round. Reports that do not belong to the open round are dropped, so
    /// an ack straggling in from an aborted reconfiguration can never
    /// complete the round that superseded it.
    pub fn collect(&mut self, task_id: u32, barrier: &Barrier) {
        let Some(round) = &mut self.round else {
            warn!(
                task_id,
                epoch = barrier.epoch,
                last_epoch = ?self.last_epoch,
                "barrier report without an open round, dropped"
            );
            return;
        };
        if !round.matches(barrier) {
            warn!(
                task_id,
                epoch = barrier.epoch,
                reconfig_id = ?reconfig_id_of(barrier),
                round_epoch = round.epoch,
                round_reconfig_id = ?round.reconfig_id,
                "stale barrier report dropped"
            );
            return;
        }

        round.remaining_tasks.remove(&task_id);
        trace!(
            task_id,
            epoch = barrier.epoch,
            remaining = round.remaining_tasks.len(),
            "barrier collected"
        );

        if round.remaining_tasks.is_empty() {
            let round = self.round.take().unwrap();
            self.last_epoch = Some(round.epoch);
            if round.collect_notifier.send(()).is_err() {
                warn!(
                    epoch = round.epoch,
                    "barrier round completed but the injector is gone"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spacker_common::config::OrderFunction;
    use spacker_meta::manager::ReconfigBarrierInfo;
    use spacker_meta::model::JobExecutionPlan;
    use spacker_meta::reconfig::even_assignment;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    const SOURCE: u32 = 0;

    fn reconfig_barrier(epoch: Epoch, reconfig_id: ReconfigId) -> Barrier {
        let plan = Arc::new(
            JobExecutionPlan::initial(2, &even_assignment(&[0, 1], 4), 4).unwrap(),
        );
        Barrier::new(epoch).with_kind(BarrierKind::ReconfigPoint(Arc::new(
            ReconfigBarrierInfo {
                reconfig_id,
                timestamp_ms: 0,
                plan_digest: plan.digest(),
                plan,
                order_function: OrderFunction::Default,
            },
        )))
    }

    fn manager_with_source() -> (LocalBarrierManager, tokio::sync::mpsc::UnboundedReceiver<Message>)
    {
        let mut manager = LocalBarrierManager::new();
        let (tx, rx) = unbounded_channel();
        manager.register_sender(SOURCE, tx);
        (manager, rx)
    }

    #[tokio::test]
    async fn test_round_completes_on_last_report() {
        let (mut manager, mut source_rx) = manager_with_source();

        let barrier = Barrier::new_test_barrier(7);
        let mut collect_rx = manager
            .send_barrier(&barrier, [SOURCE], [10, 11, 12])
            .unwrap();

        // The barrier entered the stream through the source.
        let Message::Barrier(sent) = source_rx.try_recv().unwrap() else {
            panic!("expected a barrier at the injection point");
        };
        assert_eq!(sent.epoch, 7);

        // Only the last report fires the notifier.
        for task_id in [10, 11] {
            manager.collect(task_id, &barrier);
            assert!(collect_rx.try_recv().is_err());
        }
        manager.collect(12, &barrier);
        collect_rx.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_reports_are_harmless() {
        let (mut manager, _source_rx) = manager_with_source();

        let barrier = Barrier::new_test_barrier(3);
        let mut collect_rx = manager.send_barrier(&barrier, [SOURCE], [10, 11]).unwrap();

        manager.collect(10, &barrier);
        // Reporting twice, or from a task outside the round, changes nothing.
        manager.collect(10, &barrier);
        manager.collect(42, &barrier);
        assert!(collect_rx.try_recv().is_err());

        manager.collect(11, &barrier);
        collect_rx.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_stale_reconfig_report_cannot_satisfy_round() {
        let (mut manager, _source_rx) = manager_with_source();

        // A round for reconfiguration 2 is open.
        let current = reconfig_barrier(5, 2);
        let mut collect_rx = manager.send_barrier(&current, [SOURCE], [10, 11]).unwrap();

        // A straggling cancel ack of the aborted reconfiguration 1 and a
        // report for a stale epoch are both dropped.
        let aborted = Barrier::new(5).with_kind(BarrierKind::Cancel(1));
        manager.collect(10, &aborted);
        manager.collect(11, &aborted);
        manager.collect(10, &Barrier::new_test_barrier(4));
        assert!(collect_rx.try_recv().is_err());

        // The round still needs the real reports.
        manager.collect(10, &current);
        manager.collect(11, &current);
        collect_rx.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_report_after_round_closed_is_dropped() {
        let (mut manager, _source_rx) = manager_with_source();

        let first = reconfig_barrier(1, 1);
        let collect_rx = manager.send_barrier(&first, [SOURCE], [10]).unwrap();
        manager.collect(10, &first);
        collect_rx.await.unwrap();

        // The late report of the previous round does not leak into the next.
        let second = reconfig_barrier(2, 2);
        let mut collect_rx = manager.send_barrier(&second, [SOURCE], [10, 11]).unwrap();
        manager.collect(11, &first);
        assert!(collect_rx.try_recv().is_err());
        manager.collect(10, &second);
        manager.collect(11, &second);
        collect_rx.try_recv().unwrap();
    }
}
