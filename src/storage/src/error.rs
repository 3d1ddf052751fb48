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

use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to snapshot key group {0}: {1}")]
    SnapshotFailure(u32, String),

    #[error("failed to ingest key group {0}: {1}")]
    IngestFailure(u32, String),

    #[error("state payload starts with key group {found}, expected {expected}")]
    KeyGroupMismatch { expected: u32, found: u32 },

    #[error("state payload truncated at byte {0}")]
    TruncatedPayload(usize),

    #[error("handle carries no payload bytes, only offsets")]
    SummaryHandle,

    #[error(transparent)]
    Common(#[from] spacker_common::error::CommonError),
}
