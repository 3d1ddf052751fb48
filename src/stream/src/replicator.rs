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

//! Proactive state replication between reconfigurations.
//!
//! Every cycle, the replicator ships a delta snapshot of the key groups
//! modified since the last cycle (scoped by `replicate_keys_filter` and the
//! backup target set) to the standby peers. A later migration can then skip
//! the payload for any group whose replica is still fresh and send a promote
//! marker instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spacker_common::config::SpackerConfig;
use spacker_common::hash::KeyGroup;
use spacker_meta::manager::StreamClientsRef;
use spacker_storage::StateBackend;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::task::TaskCore;

pub struct StateReplicator<S: StateBackend> {
    core: Arc<Mutex<TaskCore<S>>>,
    clients: StreamClientsRef,
    config: Arc<SpackerConfig>,

    /// Replication cycle counter; doubles as the version of every replica
    /// shipped in that cycle.
    version: u64,
}

impl<S: StateBackend> StateReplicator<S> {
    pub fn new(
        core: Arc<Mutex<TaskCore<S>>>,
        clients: StreamClientsRef,
        config: Arc<SpackerConfig>,
    ) -> Self {
        Self {
            core,
            clients,
            config,
            version: 0,
        }
    }

    /// Run replication cycles on the replicator's own timer until the task
    /// is dropped (the handle is aborted with it).
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        if self.config.replication.replicate_keys_filter == 0 {
            debug!("proactive replication disabled");
            return;
        }
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.replication.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.cycle().await;
        }
    }

    /// One replication cycle. The delta is captured under the task lock;
    /// shipping happens outside it. Failed groups stay in the changelog and
    /// are retried next cycle.
    pub async fn cycle(&mut self) {
        self.version += 1;
        let filter = self.config.replication.replicate_keys_filter;

        let captured = {
            let core = self.core.lock();
            let delta: Vec<KeyGroup> = if self.config.snapshot.changelog_enabled {
                core.state_table
                    .changelog()
                    .iter()
                    .copied()
                    .filter(|&kg| core.migration.should_replicate(kg, filter))
                    .collect()
            } else {
                // Without the changelog path, every owned group in the filter
                // is shipped each cycle.
                core.range
                    .iter()
                    .filter(|&kg| core.migration.should_replicate(kg, filter))
                    .collect()
            };
            if delta.is_empty() {
                None
            } else {
                Some((core.subtask_index, core.operator_id, core.state_table.snapshot(delta)))
            }
        };
        let Some((slot, operator_id, snapshot)) = captured else {
            return;
        };

        let kgs: Vec<KeyGroup> = snapshot.covered_key_groups().collect();
        let handle = snapshot.into_handle();
        let mut frames: HashMap<KeyGroup, Bytes> = match handle.decompose() {
            Ok(frames) => frames.into_iter().collect(),
            Err(e) => {
                warn!(err = %e, "failed to serialize replication delta");
                return;
            }
        };

        let peers: Vec<_> = self
            .clients
            .subtask_indexes()
            .into_iter()
            .filter(|&peer| peer != slot)
            .collect();

        let mut shipped = Vec::with_capacity(kgs.len());
        'groups: for kg in kgs {
            let payload = frames.remove(&kg).unwrap_or_default();
            for &peer in &peers {
                let result = match self.clients.get(peer) {
                    Ok(client) => {
                        client
                            .dispatch_replica(operator_id, kg, self.version, payload.clone())
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    // Non-fatal: the group stays dirty and retries next cycle.
                    warn!(kg = kg.as_u32(), peer, err = %e, "replica send failed");
                    continue 'groups;
                }
            }
            shipped.push(kg);
        }

        if !shipped.is_empty() {
            let mut core = self.core.lock();
            core.state_table.clear_changelog(shipped.iter().copied());
            for &kg in &shipped {
                core.migration.record_replicated(kg, self.version);
            }
            trace!(
                cycle = self.version,
                shipped = shipped.len(),
                "replication cycle finished"
            );
        }
    }
}
