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

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use spacker_common::config::{ReconfigConfig, ReconfigScenario};
use spacker_common::hash::KeyGroup;
use spacker_common::types::IdInModel;
use tracing::debug;

use super::ReconfigRequest;
use crate::error::{MetaError, MetaResult};
use crate::model::{JobExecutionPlan, LogicalAssignment};

/// Compute the logical assignment for the next epoch from the configured
/// scenario. `static` and `profiling` replay the mapping attached to the
/// request; the others derive one from the current plan and the collected
/// per-key-group load.
pub fn plan_assignment(
    config: &ReconfigConfig,
    current: &JobExecutionPlan,
    request: &ReconfigRequest,
) -> MetaResult<LogicalAssignment> {
    match config.scenario {
        ReconfigScenario::Static => require_mapping(request, "static"),
        ReconfigScenario::Profiling => {
            let mapping = require_mapping(request, "profiling")?;
            debug!(
                moved = moved_key_groups(current, &mapping),
                "profiling scenario replays captured mapping"
            );
            Ok(mapping)
        }
        ReconfigScenario::Shuffle => shuffle(config, current, request),
        ReconfigScenario::LoadBalance => load_balance(config, current, request, false),
        ReconfigScenario::LoadBalanceZipf => load_balance(config, current, request, true),
    }
}

fn require_mapping(request: &ReconfigRequest, scenario: &str) -> MetaResult<LogicalAssignment> {
    request.mapping.clone().ok_or_else(|| {
        MetaError::InvalidPlan(format!("the {} scenario requires an explicit mapping", scenario))
    })
}

fn current_assignment(plan: &JobExecutionPlan) -> LogicalAssignment {
    plan.occupied_slots()
        .map(|slot| (plan.id_in_model(slot), plan.assignment(slot).to_vec()))
        .collect()
}

fn moved_key_groups(current: &JobExecutionPlan, mapping: &LogicalAssignment) -> usize {
    let before = current_assignment(current);
    mapping
        .iter()
        .map(|(id, kgs)| match before.get(id) {
            Some(old) => kgs.iter().filter(|kg| !old.contains(kg)).count(),
            None => kgs.len(),
        })
        .sum()
}

fn rng_for(request: &ReconfigRequest) -> StdRng {
    match request.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Move a bounded random selection of key groups between random subtasks.
/// At most `reconfig.affected_tasks` subtasks participate.
fn shuffle(
    config: &ReconfigConfig,
    current: &JobExecutionPlan,
    request: &ReconfigRequest,
) -> MetaResult<LogicalAssignment> {
    let mut assignment = current_assignment(current);
    if assignment.len() < 2 {
        return Err(MetaError::InvalidPlan(
            "shuffle needs at least two subtasks".to_string(),
        ));
    }

    let mut rng = rng_for(request);
    let mut involved = assignment.keys().copied().collect_vec();
    involved.shuffle(&mut rng);
    involved.truncate(config.affected_tasks.clamp(2, involved.len()));

    let budget = config.affected_keys.max(1);
    let mut moved = 0;
    for _ in 0..budget {
        let from = *involved.choose(&mut rng).unwrap();
        let to = loop {
            let candidate = *involved.choose(&mut rng).unwrap();
            if candidate != from {
                break candidate;
            }
        };
        let from_kgs = assignment.get_mut(&from).unwrap();
        // Never strip a subtask of its last group.
        if from_kgs.len() <= 1 {
            continue;
        }
        let kg = from_kgs.remove(rng.gen_range(0..from_kgs.len()));
        assignment.get_mut(&to).unwrap().push(kg);
        moved += 1;
    }

    debug!(?involved, moved, "shuffle planned");
    Ok(assignment)
}

/// Shift load from the most loaded subtask to the least loaded one until the
/// two even out or the move budget runs out. The zipf variant moves the
/// hottest groups first, the plain variant the coldest, which keeps single
/// moves small.
fn load_balance(
    config: &ReconfigConfig,
    current: &JobExecutionPlan,
    request: &ReconfigRequest,
    hottest_first: bool,
) -> MetaResult<LogicalAssignment> {
    let mut assignment = current_assignment(current);
    if assignment.len() < 2 {
        return Err(MetaError::InvalidPlan(
            "load balancing needs at least two subtasks".to_string(),
        ));
    }

    let load_of = |kg: &KeyGroup| request.load.get(kg).copied().unwrap_or(0);
    let task_load = |kgs: &[KeyGroup]| kgs.iter().map(load_of).sum::<u64>();

    let (from, to) = {
        let loads = assignment
            .iter()
            .map(|(&id, kgs)| (id, task_load(kgs)))
            .collect_vec();
        let &(from, max) = loads.iter().max_by_key(|(_, load)| *load).unwrap();
        let &(to, min) = loads.iter().min_by_key(|(_, load)| *load).unwrap();
        if from == to || max == min {
            return Ok(assignment);
        }
        (from, to)
    };

    let budget = if config.affected_keys == 0 {
        usize::MAX
    } else {
        config.affected_keys
    };

    let mut candidates = assignment[&from].clone();
    candidates.sort_by_key(|kg| load_of(kg));
    if hottest_first {
        candidates.reverse();
    }

    let mut from_load = task_load(&assignment[&from]);
    let mut to_load = task_load(&assignment[&to]);
    let mut moved = Vec::new();
    for kg in candidates {
        if moved.len() >= budget || assignment[&from].len() - moved.len() <= 1 {
            break;
        }
        let load = load_of(&kg);
        // Only move a group if it strictly lowers the hotter side.
        if load == 0 || to_load + load >= from_load {
            continue;
        }
        from_load -= load;
        to_load += load;
        moved.push(kg);
    }

    if moved.is_empty() {
        debug!("load already balanced, nothing to move");
        return Ok(assignment);
    }

    assignment
        .get_mut(&from)
        .unwrap()
        .retain(|kg| !moved.contains(kg));
    assignment.get_mut(&to).unwrap().extend(moved.iter().copied());
    debug!(?from, ?to, moved = moved.len(), "load balance planned");
    Ok(assignment)
}

/// Map an `IdInModel` list to a round-robin assignment over the whole
/// key-group space; used when bootstrapping a job.
pub fn even_assignment(ids: &[IdInModel], max_parallelism: u32) -> LogicalAssignment {
    let mut assignment: LogicalAssignment =
        ids.iter().map(|&id| (id, Vec::new())).collect();
    let parallelism = ids.len() as u32;
    let per_task = (max_parallelism + parallelism - 1) / parallelism;
    for kg in 0..max_parallelism {
        let id = ids[(kg / per_task) as usize];
        assignment.get_mut(&id).unwrap().push(KeyGroup::new(kg));
    }
    assignment
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use spacker_common::config::OrderFunction;

    use super::*;

    fn config(scenario: ReconfigScenario, affected_keys: usize) -> ReconfigConfig {
        ReconfigConfig {
            scenario,
            affected_keys,
            affected_tasks: 2,
            sync_keys: 0,
            order_function: OrderFunction::Default,
            timeout_ms: 10_000,
            allow_partial: false,
            max_transfer_retries: 3,
        }
    }

    fn plan() -> JobExecutionPlan {
        let assignment = even_assignment(&[0, 1], 8);
        JobExecutionPlan::initial(3, &assignment, 8).unwrap()
    }

    #[test]
    fn test_even_assignment_covers_space() {
        let assignment = even_assignment(&[0, 1, 2], 8);
        let total: usize = assignment.values().map(|kgs| kgs.len()).sum();
        assert_eq!(total, 8);
        assert_eq!(assignment[&0].len(), 3);
        assert_eq!(assignment[&2].len(), 2);
    }

    #[test]
    fn test_static_requires_mapping() {
        let err = plan_assignment(
            &config(ReconfigScenario::Static, 0),
            &plan(),
            &ReconfigRequest::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MetaError::InvalidPlan(_)));
    }

    #[test]
    fn test_shuffle_is_seeded_and_bounded() {
        let request = ReconfigRequest {
            seed: Some(42),
            ..Default::default()
        };
        let cfg = config(ReconfigScenario::Shuffle, 2);
        let first = plan_assignment(&cfg, &plan(), &request).unwrap();
        let second = plan_assignment(&cfg, &plan(), &request).unwrap();
        assert_eq!(first, second);
        // A move can shuffle a group straight back, so the net effect is
        // bounded by the budget, not equal to it.
        assert!(moved_key_groups(&plan(), &first) <= 2);
        // The plan must still be derivable, i.e. cover the space once.
        JobExecutionPlan::derive(&plan(), &first).unwrap();
    }

    #[test]
    fn test_load_balance_moves_toward_cold_task() {
        let mut load = HashMap::new();
        // Task 0 owns kgs 0..4 and is hot on all of them.
        for kg in 0..4 {
            load.insert(KeyGroup::new(kg), 100);
        }
        load.insert(KeyGroup::new(4), 10);
        let request = ReconfigRequest {
            load,
            ..Default::default()
        };

        let balanced = plan_assignment(
            &config(ReconfigScenario::LoadBalance, 1),
            &plan(),
            &request,
        )
        .unwrap();
        // One hot group moved from task 0 to task 1.
        assert_eq!(balanced[&0].len(), 3);
        assert_eq!(balanced[&1].len(), 5);
        JobExecutionPlan::derive(&plan(), &balanced).unwrap();
    }

    #[test]
    fn test_load_balance_noop_when_even() {
        let request = ReconfigRequest::default();
        let balanced = plan_assignment(
            &config(ReconfigScenario::LoadBalance, 4),
            &plan(),
            &request,
        )
        .unwrap();
        assert_eq!(balanced, current_assignment(&plan()));
    }

    #[test]
    fn test_zipf_prefers_hottest() {
        let mut load = HashMap::new();
        load.insert(KeyGroup::new(0), 500);
        for kg in 1..4 {
            load.insert(KeyGroup::new(kg), 50);
        }
        let request = ReconfigRequest {
            load,
            ..Default::default()
        };

        let balanced = plan_assignment(
            &config(ReconfigScenario::LoadBalanceZipf, 1),
            &plan(),
            &request,
        )
        .unwrap();
        assert!(balanced[&1].contains(&KeyGroup::new(0)));
    }
}
