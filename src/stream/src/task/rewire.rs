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

use futures::channel::mpsc::{Receiver, Sender};
use parking_lot::Mutex;
use spacker_common::types::SubtaskIndex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::TaskControl;
use crate::error::{StreamError, StreamResult};
use crate::executor::Message;

/// Control commands for the partitioner stage, applied between messages.
pub enum DispatcherControl {
    /// Replace one downstream writer; the old one is flushed first.
    SubstituteOutput(SubtaskIndex, Sender<Message>),
    RemoveOutput(SubtaskIndex),
    /// The reconfiguration committed; drop the fallback routing.
    SealRouting,
}

#[derive(Clone)]
pub struct DispatcherHandle {
    pub control_tx: UnboundedSender<DispatcherControl>,
}

/// Rebuilds input gates and output partitions when a task's `id_in_model` or
/// key-group ownership changes, without tearing the task down.
///
/// Everything goes through control channels consumed at safe points: the
/// partitioner applies its commands between messages, the task loop applies
/// input-gate substitutions at the dispatch boundary under the task lock.
/// Nothing is lost because old writers are flushed before being dropped and
/// gate substitution is refused while a barrier alignment is in progress.
pub struct ChannelRewirer {
    dispatcher: DispatcherHandle,
    tasks: Mutex<HashMap<SubtaskIndex, UnboundedSender<TaskControl>>>,
}

impl ChannelRewirer {
    pub fn new(dispatcher: DispatcherHandle) -> Self {
        Self {
            dispatcher,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_task(&self, slot: SubtaskIndex, control_tx: UnboundedSender<TaskControl>) {
        self.tasks.lock().insert(slot, control_tx);
    }

    pub fn unregister_task(&self, slot: SubtaskIndex) {
        self.tasks.lock().remove(&slot);
    }

    fn task(&self, slot: SubtaskIndex) -> StreamResult<UnboundedSender<TaskControl>> {
        self.tasks
            .lock()
            .get(&slot)
            .cloned()
            .ok_or(StreamError::TaskNotFound(slot))
    }

    /// Substitute a task's whole input gate. The task recomputes its channel
    /// count and resets alignment state as part of the swap.
    pub fn substitute_input_gate(
        &self,
        slot: SubtaskIndex,
        inputs: Vec<Receiver<Message>>,
    ) -> StreamResult<()> {
        debug!(slot, gates = inputs.len(), "substituting input gate");
        self.task(slot)?
            .send(TaskControl::UpdateInputs(inputs))
            .map_err(|_| StreamError::RewireFailure(format!("task {} is gone", slot)))
    }

    /// Attach one more upstream channel to a task.
    pub fn add_input(&self, slot: SubtaskIndex, input: Receiver<Message>) -> StreamResult<()> {
        self.task(slot)?
            .send(TaskControl::AddInput(input))
            .map_err(|_| StreamError::RewireFailure(format!("task {} is gone", slot)))
    }

    /// Substitute the partitioner's writer towards one downstream task.
    pub fn substitute_output(
        &self,
        slot: SubtaskIndex,
        sender: Sender<Message>,
    ) -> StreamResult<()> {
        debug!(slot, "substituting result partition writer");
        self.dispatcher
            .control_tx
            .send(DispatcherControl::SubstituteOutput(slot, sender))
            .map_err(|_| StreamError::RewireFailure("partitioner is gone".to_string()))
    }

    pub fn remove_output(&self, slot: SubtaskIndex) -> StreamResult<()> {
        self.dispatcher
            .control_tx
            .send(DispatcherControl::RemoveOutput(slot))
            .map_err(|_| StreamError::RewireFailure("partitioner is gone".to_string()))
    }

    /// After a commit the previous routing can never come back.
    pub fn seal_routing(&self) -> StreamResult<()> {
        self.dispatcher
            .control_tx
            .send(DispatcherControl::SealRouting)
            .map_err(|_| StreamError::RewireFailure("partitioner is gone".to_string()))
    }

    /// Signal a task to exit at its next dispatch boundary.
    pub fn stop_task(&self, slot: SubtaskIndex) -> StreamResult<()> {
        self.task(slot)?
            .send(TaskControl::Stop)
            .map_err(|_| StreamError::RewireFailure(format!("task {} is gone", slot)))
    }
}
