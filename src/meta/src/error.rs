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

pub type MetaResult<T> = std::result::Result<T, MetaError>;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("key group {0} appears in more than one destination set")]
    PlanConflict(u32),

    #[error("a reconfiguration is already in flight (state: {0})")]
    NotIdle(&'static str),

    #[error("subtask {0} has no registered control client")]
    ClientUnavailable(u32),

    #[error("reconfig {0} aborted: {1}")]
    Aborted(u64, String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
