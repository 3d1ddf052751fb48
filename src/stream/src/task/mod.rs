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
use std::sync::Mutex;

use futures::channel::mpsc::{channel, Receiver, Sender};

use crate::error::{StreamError, StreamResult};
use crate::executor::Message;

mod barrier_manager;
mod input_processor;
mod migration;
mod rewire;
mod stream_manager;

pub use barrier_manager::*;
pub use input_processor::*;
pub use migration::*;
pub use rewire::*;
pub use stream_manager::*;

/// Default capacity of a channel between two local stages.
pub const LOCAL_OUTPUT_CHANNEL_SIZE: usize = 16;

/// The pseudo subtask id of the record source feeding the partitioner; the
/// barrier manager injects barriers through it.
pub const SOURCE_TASK_ID: u32 = u32::MAX;

pub type ConsumableChannelPair = (Option<Sender<Message>>, Option<Receiver<Message>>);
pub type UpDownTaskIds = (u32, u32);

/// Stores the data which may be modified from the control plane.
pub struct SharedContext {
    /// Stores the senders and receivers for later stage wiring.
    ///
    /// Channels are created when the topology is laid out and taken out when
    /// the stages are built. One sender or one receiver is uniquely
    /// determined by the upstream and downstream subtask ids.
    channel_pool: Mutex<HashMap<UpDownTaskIds, ConsumableChannelPair>>,

    barrier_manager: Mutex<LocalBarrierManager>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self {
            channel_pool: Mutex::new(HashMap::new()),
            barrier_manager: Mutex::new(LocalBarrierManager::new()),
        }
    }

    pub fn lock_barrier_manager(&self) -> std::sync::MutexGuard<'_, LocalBarrierManager> {
        self.barrier_manager.lock().unwrap()
    }

    /// Create (or recreate) the channel between two stages.
    pub fn add_channel_pair(&self, ids: UpDownTaskIds) {
        let (tx, rx) = channel(LOCAL_OUTPUT_CHANNEL_SIZE);
        self.channel_pool
            .lock()
            .unwrap()
            .insert(ids, (Some(tx), Some(rx)));
    }

    pub fn take_sender(&self, ids: &UpDownTaskIds) -> StreamResult<Sender<Message>> {
        self.channel_pool
            .lock()
            .unwrap()
            .get_mut(ids)
            .ok_or(StreamError::ChannelNotFound(ids.0, ids.1))?
            .0
            .take()
            .ok_or(StreamError::ChannelNotFound(ids.0, ids.1))
    }

    pub fn take_receiver(&self, ids: &UpDownTaskIds) -> StreamResult<Receiver<Message>> {
        self.channel_pool
            .lock()
            .unwrap()
            .get_mut(ids)
            .ok_or(StreamError::ChannelNotFound(ids.0, ids.1))?
            .1
            .take()
            .ok_or(StreamError::ChannelNotFound(ids.0, ids.1))
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new()
    }
}
