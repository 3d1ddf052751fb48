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

//! Job-wide configuration. The struct is deserialized from TOML once at
//! deploy time and handed to every task immutably.

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

/// Strategy used by the planner to pick the key groups to move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigScenario {
    /// Move a random selection of key groups between random task pairs.
    Shuffle,
    /// Even out key-group load using the collected per-group record counts.
    LoadBalance,
    /// Like `load_balance`, but assumes a zipf-skewed key distribution and
    /// splits the heaviest groups first.
    LoadBalanceZipf,
    /// Replay a plan captured from a profiling run.
    Profiling,
    /// Apply exactly the mapping provided with the request.
    Static,
}

/// Order in which a destination drains buffered key groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFunction {
    /// Arrival order of the state payloads.
    Default,
    Reverse,
    Random,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigConfig {
    #[serde(default = "default::reconfig::scenario")]
    pub scenario: ReconfigScenario,

    /// Target number of key groups to migrate per reconfig.
    #[serde(default = "default::reconfig::affected_keys")]
    pub affected_keys: usize,

    /// Upper bound on the number of tasks involved in one reconfig.
    #[serde(default = "default::reconfig::affected_tasks")]
    pub affected_tasks: usize,

    /// How many key groups to transfer per control round. `0` ships the whole
    /// affected range at once.
    #[serde(default = "default::reconfig::sync_keys")]
    pub sync_keys: usize,

    #[serde(default = "default::reconfig::order_function")]
    pub order_function: OrderFunction,

    #[serde(default = "default::reconfig::timeout_ms")]
    pub timeout_ms: u64,

    /// On transfer timeout, commit what has arrived instead of aborting.
    #[serde(default = "default::reconfig::allow_partial")]
    pub allow_partial: bool,

    /// Transfer retries per key group before the reconfig is aborted.
    #[serde(default = "default::reconfig::max_transfer_retries")]
    pub max_transfer_retries: usize,
}

impl Default for ReconfigConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// `0` disables proactive replication. `N > 0` replicates key groups with
    /// `kg % N == 0`, so `1` replicates everything.
    #[serde(default = "default::replication::replicate_keys_filter")]
    pub replicate_keys_filter: u32,

    /// Length of one replication cycle.
    #[serde(default = "default::replication::interval_ms")]
    pub interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Use the delta-changelog path for snapshots between reconfigs.
    #[serde(default = "default::snapshot::changelog_enabled")]
    pub changelog_enabled: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateBackendConfig {
    /// Run the serialize-and-ship phase of snapshots off the task thread.
    #[serde(default = "default::state_backend::async_snapshot")]
    pub async_snapshot: bool,
}

impl Default for StateBackendConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmissionConfig {
    /// Split state payloads into chunks instead of one message per key group.
    #[serde(default = "default::transmission::chunked_enabled")]
    pub chunked_enabled: bool,

    #[serde(default = "default::transmission::chunk_size_kb")]
    pub chunk_size_kb: usize,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Comma-separated names of the operators the coordinator may target.
    /// Empty targets every keyed operator.
    #[serde(default = "default::controller::target_operators")]
    pub target_operators: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpackerConfig {
    /// Job-wide upper bound on parallelism; fixes the key-group space.
    #[serde(default = "default::max_parallelism")]
    pub max_parallelism: u32,

    #[serde(default)]
    pub reconfig: ReconfigConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub state_backend: StateBackendConfig,

    #[serde(default)]
    pub transmission: TransmissionConfig,

    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Default for SpackerConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl SpackerConfig {
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CommonError::ConfigIo {
            path: path.to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn target_operator_names(&self) -> Vec<&str> {
        self.controller
            .target_operators
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

mod default {
    pub fn max_parallelism() -> u32 {
        128
    }

    pub mod reconfig {
        use crate::config::{OrderFunction, ReconfigScenario};

        pub fn scenario() -> ReconfigScenario {
            ReconfigScenario::Static
        }

        pub fn affected_keys() -> usize {
            0
        }

        pub fn affected_tasks() -> usize {
            2
        }

        pub fn sync_keys() -> usize {
            0
        }

        pub fn order_function() -> OrderFunction {
            OrderFunction::Default
        }

        pub fn timeout_ms() -> u64 {
            10_000
        }

        pub fn allow_partial() -> bool {
            false
        }

        pub fn max_transfer_retries() -> usize {
            3
        }
    }

    pub mod replication {
        pub fn replicate_keys_filter() -> u32 {
            0
        }

        pub fn interval_ms() -> u64 {
            1_000
        }
    }

    pub mod snapshot {
        pub fn changelog_enabled() -> bool {
            true
        }
    }

    pub mod state_backend {
        pub fn async_snapshot() -> bool {
            true
        }
    }

    pub mod transmission {
        pub fn chunked_enabled() -> bool {
            false
        }

        pub fn chunk_size_kb() -> usize {
            64
        }
    }

    pub mod controller {
        pub fn target_operators() -> String {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpackerConfig::default();
        assert_eq!(config.max_parallelism, 128);
        assert_eq!(config.reconfig.scenario, ReconfigScenario::Static);
        assert_eq!(config.reconfig.order_function, OrderFunction::Default);
        assert_eq!(config.replication.replicate_keys_filter, 0);
        assert!(config.snapshot.changelog_enabled);
        assert!(!config.transmission.chunked_enabled);
    }

    #[test]
    fn test_partial_override() {
        let toml = r#"
            max_parallelism = 8

            [reconfig]
            scenario = "load_balance"
            order_function = "reverse"
            sync_keys = 2

            [replication]
            replicate_keys_filter = 1
        "#;
        let config: SpackerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_parallelism, 8);
        assert_eq!(config.reconfig.scenario, ReconfigScenario::LoadBalance);
        assert_eq!(config.reconfig.order_function, OrderFunction::Reverse);
        assert_eq!(config.reconfig.sync_keys, 2);
        assert_eq!(config.replication.replicate_keys_filter, 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.reconfig.timeout_ms, 10_000);
        assert!(config.state_backend.async_snapshot);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_parallelism = 16").unwrap();
        let config = SpackerConfig::from_toml_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.max_parallelism, 16);

        assert!(SpackerConfig::from_toml_file("/nonexistent/spacker.toml").is_err());
    }

    #[test]
    fn test_target_operator_names() {
        let mut config = SpackerConfig::default();
        assert!(config.target_operator_names().is_empty());
        config.controller.target_operators = "keyed_count, window_join".to_string();
        assert_eq!(
            config.target_operator_names(),
            vec!["keyed_count", "window_join"]
        );
    }
}
