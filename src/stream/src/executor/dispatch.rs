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

use futures::channel::mpsc::Sender;
use futures::SinkExt;
use spacker_common::hash::KeyGroup;
use spacker_common::types::SubtaskIndex;
use tracing::{debug, trace};

use super::{BarrierKind, Message};
use crate::error::{StreamError, StreamResult};

/// The partitioner stage: routes records to downstream subtasks by key group
/// and broadcasts barriers to every output.
///
/// Routing is deterministic, so per-key-group record order equals emission
/// order. On a reconfig-point barrier the routing table switches to the new
/// plan *after* the barrier has been broadcast: every record a source
/// processed precedes the barrier on its channel, and every record for a
/// migrating group behind the barrier already flows to the destination,
/// where it is buffered until the state arrives.
pub struct HashDataDispatcher {
    max_parallelism: u32,

    /// `kg -> downstream subtask` under the current plan.
    routing: HashMap<KeyGroup, SubtaskIndex>,

    /// Routing to fall back to when an in-flight reconfiguration aborts.
    prev_routing: Option<HashMap<KeyGroup, SubtaskIndex>>,

    outputs: HashMap<SubtaskIndex, Sender<Message>>,
}

impl HashDataDispatcher {
    pub fn new(
        max_parallelism: u32,
        routing: HashMap<KeyGroup, SubtaskIndex>,
        outputs: HashMap<SubtaskIndex, Sender<Message>>,
    ) -> Self {
        Self {
            max_parallelism,
            routing,
            prev_routing: None,
            outputs,
        }
    }

    /// Dispatch one message. Barriers fan out to every output; a
    /// reconfig-point additionally swaps the routing table, a cancel marker
    /// swaps it back.
    pub async fn dispatch(&mut self, message: Message) -> StreamResult<()> {
        match message {
            Message::Record(record) => {
                let kg = record.key_group(self.max_parallelism);
                let subtask = *self
                    .routing
                    .get(&kg)
                    .ok_or_else(|| StreamError::TaskNotFound(kg.as_u32()))?;
                let output = self
                    .outputs
                    .get_mut(&subtask)
                    .ok_or(StreamError::TaskNotFound(subtask))?;
                output
                    .send(Message::Record(record))
                    .await
                    .map_err(|_| StreamError::ChannelClosed)?;
                trace!(kg = kg.as_u32(), subtask, "record dispatched");
            }
            Message::Barrier(barrier) => {
                for output in self.outputs.values_mut() {
                    output
                        .send(Message::Barrier(barrier.clone()))
                        .await
                        .map_err(|_| StreamError::ChannelClosed)?;
                }
                match &barrier.kind {
                    BarrierKind::ReconfigPoint(info) => {
                        let mut next = HashMap::new();
                        for slot in info.plan.occupied_slots() {
                            for &kg in info.plan.assignment(slot) {
                                next.insert(kg, slot);
                            }
                        }
                        debug!(
                            reconfig_id = info.reconfig_id,
                            "partitioner switched to new routing"
                        );
                        self.prev_routing = Some(std::mem::replace(&mut self.routing, next));
                    }
                    BarrierKind::Cancel(reconfig_id) => {
                        if let Some(prev) = self.prev_routing.take() {
                            debug!(reconfig_id, "partitioner reverted routing");
                            self.routing = prev;
                        }
                    }
                    BarrierKind::Checkpoint => {
                        // A completed checkpoint means the previous plan can
                        // no longer come back.
                        self.prev_routing = None;
                    }
                    BarrierKind::Stop => {}
                }
            }
        }
        Ok(())
    }

    /// The reconfiguration committed; the old routing is dead.
    pub fn seal_routing(&mut self) {
        self.prev_routing = None;
    }

    /// Substitute one downstream writer. The old writer is flushed before
    /// being dropped so no buffered record is lost.
    pub async fn substitute_output(
        &mut self,
        subtask: SubtaskIndex,
        sender: Sender<Message>,
    ) -> StreamResult<()> {
        if let Some(mut old) = self.outputs.insert(subtask, sender) {
            old.flush().await.map_err(|_| {
                StreamError::RewireFailure(format!("failed to flush output to {}", subtask))
            })?;
        }
        Ok(())
    }

    pub fn remove_output(&mut self, subtask: SubtaskIndex) {
        self.outputs.remove(&subtask);
    }

    pub fn route_of(&self, kg: KeyGroup) -> Option<SubtaskIndex> {
        self.routing.get(&kg).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use futures::StreamExt;
    use spacker_common::config::OrderFunction;
    use spacker_meta::manager::ReconfigBarrierInfo;
    use spacker_meta::model::JobExecutionPlan;
    use spacker_meta::reconfig::even_assignment;

    use super::*;
    use crate::executor::{Barrier, StreamRecord};

    fn routing_of(plan: &JobExecutionPlan) -> HashMap<KeyGroup, SubtaskIndex> {
        let mut routing = HashMap::new();
        for slot in plan.occupied_slots() {
            for &kg in plan.assignment(slot) {
                routing.insert(kg, slot);
            }
        }
        routing
    }

    #[tokio::test]
    async fn test_routing_follows_reconfig_and_cancel() {
        let initial = JobExecutionPlan::initial(2, &even_assignment(&[0, 1], 8), 8).unwrap();
        let swapped = JobExecutionPlan::derive(&initial, &{
            let mut mapping = even_assignment(&[0, 1], 8);
            // kg 0 moves from subtask 0 to subtask 1.
            let kg = mapping.get_mut(&0).unwrap().remove(0);
            mapping.get_mut(&1).unwrap().push(kg);
            mapping
        })
        .unwrap();

        let (tx0, mut rx0) = futures::channel::mpsc::channel(16);
        let (tx1, mut rx1) = futures::channel::mpsc::channel(16);
        let outputs = HashMap::from([(0, tx0), (1, tx1)]);
        let mut dispatcher = HashDataDispatcher::new(8, routing_of(&initial), outputs);

        let kg0_key: Vec<u8> = {
            // Find a key hashing to kg 0.
            (0u32..)
                .map(|i| format!("probe-{}", i).into_bytes())
                .find(|key| KeyGroup::from_key(key, 8) == KeyGroup::new(0))
                .unwrap()
        };

        dispatcher
            .dispatch(Message::Record(StreamRecord::new(kg0_key.clone(), "a")))
            .await
            .unwrap();
        assert_matches!(rx0.next().await.unwrap(), Message::Record(_));

        let info = ReconfigBarrierInfo {
            reconfig_id: 1,
            timestamp_ms: 0,
            plan_digest: swapped.digest(),
            plan: Arc::new(swapped),
            order_function: OrderFunction::Default,
        };
        dispatcher
            .dispatch(Message::Barrier(
                Barrier::new(10).with_kind(BarrierKind::ReconfigPoint(Arc::new(info))),
            ))
            .await
            .unwrap();
        // Both outputs see the barrier.
        assert_matches!(rx0.next().await.unwrap(), Message::Barrier(_));
        assert_matches!(rx1.next().await.unwrap(), Message::Barrier(_));

        // Records for the moved group now reach subtask 1.
        assert_eq!(dispatcher.route_of(KeyGroup::new(0)), Some(1));
        dispatcher
            .dispatch(Message::Record(StreamRecord::new(kg0_key.clone(), "b")))
            .await
            .unwrap();
        assert_matches!(rx1.next().await.unwrap(), Message::Record(_));

        // A cancel marker restores the old ownership.
        dispatcher
            .dispatch(Message::Barrier(
                Barrier::new(11).with_kind(BarrierKind::Cancel(1)),
            ))
            .await
            .unwrap();
        dispatcher
            .dispatch(Message::Record(StreamRecord::new(kg0_key, "c")))
            .await
            .unwrap();
        assert_matches!(rx0.next().await.unwrap(), Message::Barrier(_));
        assert_matches!(rx0.next().await.unwrap(), Message::Record(_));
    }
}
