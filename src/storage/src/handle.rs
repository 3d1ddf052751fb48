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

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spacker_common::hash::{KeyGroup, KeyGroupRange};

use crate::backend::StateEntry;
use crate::error::{StorageError, StorageResult};

/// Key-group-addressable snapshot artifact.
///
/// One byte stream holds every covered key group's payload back to back, in
/// aligned order. `offsets[i]` is the byte position of aligned index `i`'s
/// frame; an empty key group writes no frame, so its offset equals the next
/// one. Each non-empty frame starts with the key group id for validation:
///
/// ```text
/// [kg: u32 le] ( [ns_len: u32 le][ns] [key_len: u32 le][key] [val_len: u32 le][val] )*
/// ```
///
/// Handles are moveable-only artifacts: a source creates one during the
/// reconfig-point snapshot and gives the per-group slices away; the handle is
/// dropped once the destination acknowledges ingestion.
#[derive(Debug, Clone)]
pub struct KeyGroupStateHandle {
    range: KeyGroupRange,
    offsets: Vec<u64>,
    modified: Vec<bool>,
    data: Bytes,
}

impl KeyGroupStateHandle {
    pub(crate) fn new(
        range: KeyGroupRange,
        offsets: Vec<u64>,
        modified: Vec<bool>,
        data: Bytes,
    ) -> Self {
        debug_assert_eq!(offsets.len(), range.len());
        debug_assert_eq!(modified.len(), range.len());
        debug_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        Self {
            range,
            offsets,
            modified,
            data,
        }
    }

    pub fn key_group_range(&self) -> &KeyGroupRange {
        &self.range
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Whether the key group was dirty in this snapshot.
    pub fn is_modified(&self, kg: KeyGroup) -> StorageResult<bool> {
        let aligned = self.range.map_from_hashed_to_aligned(kg)?;
        Ok(self.modified[aligned])
    }

    /// A summary keeps the offsets table for bookkeeping but drops the
    /// payload, so the coordinator never holds real state bytes.
    pub fn to_summary(&self) -> Self {
        Self {
            range: self.range.clone(),
            offsets: self.offsets.clone(),
            modified: self.modified.clone(),
            data: Bytes::new(),
        }
    }

    pub fn is_summary(&self) -> bool {
        self.data.is_empty() && self.offsets.last().copied().unwrap_or(0) > 0
    }

    pub fn total_bytes(&self) -> usize {
        self.data.len()
    }

    fn frame_end(&self, aligned: usize) -> u64 {
        self.offsets
            .get(aligned + 1)
            .copied()
            .unwrap_or(self.data.len() as u64)
    }

    /// The frame of one key group, header included. Empty bytes for an empty
    /// group.
    pub fn byte_slice_of(&self, kg: KeyGroup) -> StorageResult<Bytes> {
        if self.is_summary() {
            return Err(StorageError::SummaryHandle);
        }
        let aligned = self.range.map_from_hashed_to_aligned(kg)?;
        let start = self.offsets[aligned] as usize;
        let end = self.frame_end(aligned) as usize;
        if start == end {
            return Ok(Bytes::new());
        }
        let slice = self.data.slice(start..end);
        let mut header = &slice[..4];
        let found = header.get_u32_le();
        if found != kg.as_u32() {
            return Err(StorageError::KeyGroupMismatch {
                expected: kg.as_u32(),
                found,
            });
        }
        Ok(slice)
    }

    /// Break the handle into per-key-group frames for transfer, skipping empty
    /// groups. Consumes the handle: after decomposition the slices are the
    /// only live references to the payload.
    pub fn decompose(self) -> StorageResult<Vec<(KeyGroup, Bytes)>> {
        let mut parts = Vec::with_capacity(self.range.len());
        for kg in self.range.iter() {
            let slice = self.byte_slice_of(kg)?;
            if !slice.is_empty() {
                parts.push((kg, slice));
            }
        }
        Ok(parts)
    }

    /// Parse one frame back into its entries, validating the header.
    pub fn parse_frame(kg: KeyGroup, frame: &Bytes) -> StorageResult<Vec<StateEntry>> {
        let mut buf = frame.clone();
        if buf.remaining() < 4 {
            return Err(StorageError::TruncatedPayload(frame.len()));
        }
        let found = buf.get_u32_le();
        if found != kg.as_u32() {
            return Err(StorageError::KeyGroupMismatch {
                expected: kg.as_u32(),
                found,
            });
        }

        let mut entries = Vec::new();
        while buf.has_remaining() {
            let namespace = read_chunk(&mut buf, frame.len())?;
            let key = read_chunk(&mut buf, frame.len())?;
            let value = read_chunk(&mut buf, frame.len())?;
            entries.push(StateEntry {
                namespace,
                key,
                value,
            });
        }
        Ok(entries)
    }
}

fn read_chunk(buf: &mut Bytes, frame_len: usize) -> StorageResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(StorageError::TruncatedPayload(frame_len - buf.remaining()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(StorageError::TruncatedPayload(frame_len - buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Incremental writer used by the snapshot path.
pub(crate) struct HandleWriter {
    covered: Vec<KeyGroup>,
    offsets: Vec<u64>,
    modified: Vec<bool>,
    buf: BytesMut,
}

impl HandleWriter {
    pub fn new() -> Self {
        Self {
            covered: Vec::new(),
            offsets: Vec::new(),
            modified: Vec::new(),
            buf: BytesMut::new(),
        }
    }

    /// Append one key group's entries. Must be called once per covered group
    /// in aligned order; an empty entry list writes no frame.
    pub fn append(
        &mut self,
        kg: KeyGroup,
        modified: bool,
        entries: impl Iterator<Item = StateEntry>,
    ) {
        self.covered.push(kg);
        self.offsets.push(self.buf.len() as u64);
        self.modified.push(modified);

        let mut wrote_header = false;
        for entry in entries {
            if !wrote_header {
                self.buf.put_u32_le(kg.as_u32());
                wrote_header = true;
            }
            for chunk in [&entry.namespace, &entry.key, &entry.value] {
                self.buf.put_u32_le(chunk.len() as u32);
                self.buf.put_slice(chunk);
            }
        }
    }

    pub fn finish(self) -> KeyGroupStateHandle {
        KeyGroupStateHandle::new(
            KeyGroupRange::new(self.covered),
            self.offsets,
            self.modified,
            self.buf.freeze(),
        )
    }
}
