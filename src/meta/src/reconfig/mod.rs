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

mod coordinator;
mod planner;

use std::collections::HashMap;

pub use coordinator::*;
pub use planner::*;
use spacker_common::hash::KeyGroup;
use spacker_common::types::OperatorId;

use crate::model::LogicalAssignment;

/// Per-key-group progress reported by tasks while a reconfiguration is in
/// flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KgStatus {
    /// The source captured the group in its affected snapshot.
    SnapshotTaken,
    /// The payload reached the destination task.
    Transferred,
    /// The destination promoted its replica instead of receiving a payload.
    ReplicaPromoted,
    /// The destination applied the state to its table.
    Ingested,
    /// The destination drained the group's buffered records.
    Drained,
    /// The source dropped its changelog entries and in-memory state.
    SourceReleased,
    Failed(String),
}

/// A migration request handed to the coordinator.
#[derive(Clone, Debug, Default)]
pub struct ReconfigRequest {
    pub operator_id: OperatorId,

    /// Name of the targeted operator, checked against
    /// `controller.target_operators` when that list is configured.
    pub operator_name: String,

    /// Required for the `static` and `profiling` scenarios; ignored by the
    /// others, which compute their own mapping.
    pub mapping: Option<LogicalAssignment>,

    /// Per-key-group record counts collected since the last reconfiguration,
    /// feeding the load-balance planners.
    pub load: HashMap<KeyGroup, u64>,

    /// Fixes the planner's randomness, for reproducible runs.
    pub seed: Option<u64>,
}
