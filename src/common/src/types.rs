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

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical slot index of a subtask. Slots are provisioned once at job start
/// and may exceed the running parallelism.
pub type SubtaskIndex = u32;

/// Logical identifier of a subtask across reconfigurations. Stable while the
/// physical slot index may change.
pub type IdInModel = u32;

/// Sentinel for provisioned but unoccupied slots.
pub const ID_IN_MODEL_UNUSED: IdInModel = IdInModel::MAX;

pub type OperatorId = u64;

/// Identifies one deployment of a subtask. A restarted subtask gets a fresh
/// execution id.
pub type ExecutionId = u64;

/// Monotonic identifier stamped by the reconfig coordinator on each
/// reconfiguration attempt.
pub type ReconfigId = u64;

pub type Epoch = u64;

/// Where a subtask can be reached for state dispatch.
///
/// The engine's transport resolves this to a connection; within one process it
/// is only a routing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskAddr {
    pub subtask_index: SubtaskIndex,
    pub id_in_model: IdInModel,
}

impl fmt::Display for SubtaskAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subtask-{}/model-{}", self.subtask_index, self.id_in_model)
    }
}
