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

pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("channel between {0} and {1} does not exist")]
    ChannelNotFound(u32, u32),

    #[error("upstream channel closed unexpectedly")]
    ChannelClosed,

    #[error("subtask {0} is not built")]
    TaskNotFound(u32),

    #[error("failed to rewire channels: {0}")]
    RewireFailure(String),

    #[error("operator error: {0}")]
    Operator(#[source] anyhow::Error),

    #[error(transparent)]
    Storage(#[from] spacker_storage::StorageError),

    #[error(transparent)]
    Meta(#[from] spacker_meta::MetaError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
