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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spacker_common::hash::{KeyGroup, KeyGroupRange};
use spacker_common::types::{ExecutionId, IdInModel, OperatorId, ReconfigId, SubtaskIndex};
use spacker_meta::manager::{BarrierInjector, ReconfigBarrierInfo, StreamControlClient};
use spacker_meta::{MetaError, MetaResult};
use spacker_stream::executor::{Barrier, BarrierKind};
use spacker_stream::task::LocalStreamManager;
use tracing::error;

fn to_meta_error(e: spacker_stream::StreamError) -> MetaError {
    MetaError::Internal(anyhow::anyhow!(e))
}

/// Reassembles chunked state payloads, keyed by `(kg, version)`. With the
/// chunked framing, one `dispatch_state` call arrives as several pieces that
/// only hit the state table once the last piece is in.
#[derive(Default)]
struct ChunkBuffer {
    pending: Mutex<HashMap<(KeyGroup, u64), BytesMut>>,
}

impl ChunkBuffer {
    /// Append one piece; returns the whole payload when `last` is set.
    fn push(&self, kg: KeyGroup, version: u64, piece: Bytes, last: bool) -> Option<Bytes> {
        let mut pending = self.pending.lock();
        let buf = pending.entry((kg, version)).or_default();
        buf.extend_from_slice(&piece);
        if last {
            Some(pending.remove(&(kg, version)).unwrap().freeze())
        } else {
            None
        }
    }

    fn discard(&self) {
        self.pending.lock().clear();
    }
}

/// The control service of one subtask: the coordinator and peer tasks call
/// these endpoints; the implementation dispatches straight into the local
/// stream manager. A networked deployment would put the engine's RPC
/// transport in front of exactly this surface.
pub struct StreamServiceImpl {
    manager: Arc<LocalStreamManager>,
    subtask_index: SubtaskIndex,
    chunks: ChunkBuffer,
    chunk_size: usize,
}

impl StreamServiceImpl {
    pub fn new(manager: Arc<LocalStreamManager>, subtask_index: SubtaskIndex) -> Self {
        let config = manager.config();
        let chunk_size = if config.transmission.chunked_enabled {
            (config.transmission.chunk_size_kb * 1024).max(1)
        } else {
            usize::MAX
        };
        Self {
            manager,
            subtask_index,
            chunks: ChunkBuffer::default(),
            chunk_size,
        }
    }
}

#[async_trait]
impl StreamControlClient for StreamServiceImpl {
    async fn dispatch_state_to_task(
        &self,
        execution_id: ExecutionId,
        _operator_id: OperatorId,
        key_group_range: KeyGroupRange,
        id_in_model: IdInModel,
    ) -> MetaResult<()> {
        let mut range = key_group_range;
        range.reindex();
        self.manager
            .on_dispatch_state_to_task(self.subtask_index, execution_id, range, id_in_model)
            .map_err(to_meta_error)
    }

    async fn dispatch_state(
        &self,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        payload: Bytes,
    ) -> MetaResult<()> {
        // The chunked framing splits large payloads; a single-message
        // deployment passes straight through.
        if payload.len() > self.chunk_size {
            let mut offset = 0;
            while offset < payload.len() {
                let end = (offset + self.chunk_size).min(payload.len());
                let piece = payload.slice(offset..end);
                offset = end;
                if let Some(whole) = self.chunks.push(kg, version, piece, end == payload.len()) {
                    self.manager
                        .on_dispatch_state(self.subtask_index, operator_id, kg, version, whole)
                        .map_err(to_meta_error)?;
                }
            }
            Ok(())
        } else {
            self.manager
                .on_dispatch_state(self.subtask_index, operator_id, kg, version, payload)
                .map_err(to_meta_error)
        }
    }

    async fn promote_replica(
        &self,
        operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        reconfig_id: ReconfigId,
    ) -> MetaResult<()> {
        self.manager
            .on_promote_replica(self.subtask_index, operator_id, kg, version, reconfig_id)
            .map_err(to_meta_error)
    }

    async fn dispatch_replica(
        &self,
        _operator_id: OperatorId,
        kg: KeyGroup,
        version: u64,
        payload: Bytes,
    ) -> MetaResult<()> {
        self.manager
            .on_dispatch_replica(self.subtask_index, kg, version, payload)
            .map_err(to_meta_error)
    }

    async fn update_backup_key_groups(
        &self,
        _execution_id: ExecutionId,
        _operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
    ) -> MetaResult<()> {
        self.manager
            .on_update_backup_key_groups(self.subtask_index, kgs)
            .map_err(to_meta_error)
    }

    async fn release_key_groups(
        &self,
        reconfig_id: ReconfigId,
        _operator_id: OperatorId,
        kgs: Vec<KeyGroup>,
    ) -> MetaResult<()> {
        self.manager
            .on_release_key_groups(self.subtask_index, reconfig_id, kgs)
            .map_err(to_meta_error)
    }

    async fn finish_reconfig(&self, reconfig_id: ReconfigId) -> MetaResult<()> {
        self.chunks.discard();
        self.manager
            .on_finish_reconfig(self.subtask_index, reconfig_id)
            .map_err(to_meta_error)
    }
}

/// Injects control barriers at the node's source stage on behalf of the
/// coordinator and waits for every task to align.
pub struct LocalBarrierInjector {
    manager: Arc<LocalStreamManager>,
    epoch: AtomicU64,
}

impl LocalBarrierInjector {
    pub fn new(manager: Arc<LocalStreamManager>) -> Self {
        Self {
            manager,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn inject(&self, kind: BarrierKind) -> MetaResult<()> {
        let barrier = Barrier::new(self.next_epoch()).with_kind(kind);
        let collect_from = self.manager.subtask_indexes();
        self.manager
            .send_and_collect_barrier(barrier, collect_from)
            .await
            .map_err(|e| {
                error!(err = %e, "barrier injection failed");
                to_meta_error(e)
            })
    }

    /// Inject an ordinary checkpoint barrier, e.g. from the periodic
    /// checkpoint timer.
    pub async fn inject_checkpoint(&self) -> MetaResult<()> {
        self.inject(BarrierKind::Checkpoint).await
    }
}

#[async_trait]
impl BarrierInjector for LocalBarrierInjector {
    async fn inject_reconfig_barrier(&self, info: ReconfigBarrierInfo) -> MetaResult<()> {
        self.inject(BarrierKind::ReconfigPoint(Arc::new(info))).await
    }

    async fn inject_cancel(&self, reconfig_id: ReconfigId) -> MetaResult<()> {
        self.inject(BarrierKind::Cancel(reconfig_id)).await
    }
}
