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

//! Data plane of the migration subsystem: stream messages and barriers, the
//! per-task input processor with its migration hooks, channel rewiring, and
//! proactive state replication.

mod error;
pub mod executor;
pub mod replicator;
pub mod task;

pub use error::{StreamError, StreamResult};
