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
use spacker_common::hash::KeyGroup;
use spacker_common::types::{Epoch, ReconfigId};
use spacker_meta::manager::ReconfigBarrierInfo;

use crate::error::StreamResult;

mod dispatch;
mod keyed_count;
mod merge;

pub use dispatch::*;
pub use keyed_count::*;
pub use merge::*;

/// One keyed record on the stream. The payload layout belongs to the user
/// operator; routing only ever looks at the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub key: Bytes,
    pub payload: Bytes,
}

impl StreamRecord {
    pub fn new(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }

    pub fn key_group(&self, max_parallelism: u32) -> KeyGroup {
        KeyGroup::from_key(&self.key, max_parallelism)
    }
}

/// What a barrier means. A reconfig-point aligns exactly like a checkpoint
/// but triggers the affected-state snapshot path instead of a full one.
#[derive(Clone, Debug)]
pub enum BarrierKind {
    Checkpoint,
    ReconfigPoint(Arc<ReconfigBarrierInfo>),
    /// Aborts the reconfiguration with the same id; tasks discard partial
    /// transfers and revert to the previous plan.
    Cancel(ReconfigId),
    /// Tears the stream down.
    Stop,
}

#[derive(Clone, Debug)]
pub struct Barrier {
    pub epoch: Epoch,
    pub kind: BarrierKind,
}

impl Barrier {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            kind: BarrierKind::Checkpoint,
        }
    }

    #[must_use]
    pub fn with_kind(self, kind: BarrierKind) -> Self {
        Self { kind, ..self }
    }

    #[cfg(test)]
    pub fn new_test_barrier(epoch: Epoch) -> Self {
        Self::new(epoch)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self.kind, BarrierKind::Stop)
    }
}

impl PartialEq for Barrier {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Record(StreamRecord),
    Barrier(Barrier),
}

impl Message {
    /// Return true if the message is a stop barrier, meaning the stream
    /// will not continue.
    pub fn is_terminate(&self) -> bool {
        matches!(self, Message::Barrier(barrier) if barrier.is_stop())
    }
}

/// `Executor` pulls messages from its upstream and hands them on, handling
/// control messages along the way.
#[async_trait]
pub trait Executor: Send + 'static {
    async fn next(&mut self) -> StreamResult<Message>;

    /// Identity string of the executor.
    fn identity(&self) -> &str;
}
