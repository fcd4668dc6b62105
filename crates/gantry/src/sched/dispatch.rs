//! Grouping of prepared tests into allocation requests, and their dispatch
//! through the backend.
//!
//! Tests are batched per chunk and then split into three lanes. Tests that
//! allow sharing and agree on an allocation shape ride together in one job;
//! tests the backend may place anywhere go out one flexible job each; the
//! rest get node-pinned jobs carved out of the chunk. Failures never abort
//! the batch, they accumulate and the rest of the tests still dispatch.

use std::time::Duration;

use thiserror::Error;

use crate::Map;
use crate::common::strutils::compose_job_name;
use crate::sched::backend::{AllocRequest, AllocTarget};
use crate::sched::chunking::{Chunk, ChunkGroupKey};
use crate::sched::config::{
    NodeRange, ReservationRequest, ScheduleConfig, ShareMode, calc_node_range,
};
use crate::sched::nodes::{Node, NodeList, NodeName};
use crate::sched::status::RunState;
use crate::sched::testrun::{ChunkSpec, TestId, TestRun};
use crate::sched::{SchedulerError, SchedulerPlugin, test_ids};

/// One failed allocation attempt and the tests it covered. Dispatch carries
/// on past failures; the caller gets the full set at the end.
#[derive(Debug, Error)]
#[error("Could not dispatch tests {tests:?}: {error}")]
pub struct DispatchError {
    pub tests: Vec<TestId>,
    pub error: SchedulerError,
}

/// Tests agree on this key exactly when they can ride in one shared
/// allocation: same concrete node range and same scheduler-visible account
/// knobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JobShareKey {
    node_range: NodeRange,
    partition: Option<String>,
    reservation: Option<ReservationRequest>,
    account: Option<String>,
    qos: Option<String>,
}

impl JobShareKey {
    fn new(config: &ScheduleConfig, node_range: NodeRange) -> Self {
        JobShareKey {
            node_range,
            partition: config.partition.clone(),
            reservation: config.reservation.clone(),
            account: config.account.clone(),
            qos: config.qos.clone(),
        }
    }
}

/// The least-used chunk index; ties go to the lowest index.
fn least_used(usage: &[u64]) -> usize {
    usage
        .iter()
        .enumerate()
        .min_by_key(|&(_, &count)| count)
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn fail_test(test: &mut TestRun, error: &SchedulerError) {
    test.status.set(RunState::SchedError, error.to_string());
    test.status.mark_complete();
}

impl SchedulerPlugin {
    /// Dispatch a batch of build-complete tests. Every test either ends up
    /// SCHEDULED under some job, or SCHED_ERROR with a matching entry in the
    /// returned error list.
    pub fn schedule_tests(&mut self, tests: &mut [TestRun]) -> Vec<DispatchError> {
        let mut errors = Vec::new();
        if self.backend.is_advanced() {
            self.schedule_chunked(tests, &mut errors);
        } else {
            self.schedule_by_range(tests, &mut errors);
        }
        errors
    }

    /// Advanced path: resolve each test's chunk, then dispatch the tests on
    /// each chunk together.
    fn schedule_chunked(&mut self, tests: &mut [TestRun], errors: &mut Vec<DispatchError>) {
        let mut groups: Vec<((ChunkGroupKey, usize), Vec<usize>)> = Vec::new();

        for idx in 0..tests.len() {
            let test = &mut tests[idx];
            if let Err(error) = self.prepare_test(test) {
                fail_test(test, &error);
                errors.push(DispatchError {
                    tests: vec![test.id],
                    error,
                });
                continue;
            }

            // prepare_test assigned both of these on the advanced path.
            let node_list_id = test.node_list_id.unwrap();
            let list_len = self.node_lists.get(node_list_id).unwrap().len();
            let key = ChunkGroupKey::new(node_list_id, &test.config, list_len);

            let chunk_count = self.chunk_sets[&key].len();
            let chunk_idx = match test.chunk_spec {
                ChunkSpec::Any => least_used(&self.chunk_usage[&key]),
                ChunkSpec::Index(index) if index < chunk_count => index,
                ChunkSpec::Index(index) => {
                    let error = SchedulerError::ChunkOutOfRange {
                        index,
                        available: chunk_count,
                    };
                    fail_test(test, &error);
                    errors.push(DispatchError {
                        tests: vec![test.id],
                        error,
                    });
                    continue;
                }
            };
            self.chunk_usage.get_mut(&key).unwrap()[chunk_idx] += 1;

            match groups
                .iter_mut()
                .find(|((k, c), _)| *k == key && *c == chunk_idx)
            {
                Some((_, idxs)) => idxs.push(idx),
                None => groups.push(((key, chunk_idx), vec![idx])),
            }
        }

        for ((key, chunk_idx), idxs) in groups {
            let chunk = self.chunk_sets[&key][chunk_idx].clone();
            self.schedule_chunk(&chunk, &idxs, tests, errors);
        }
    }

    /// Dispatch all tests bound to one chunk, splitting them into the
    /// share/flex/independent lanes.
    fn schedule_chunk(
        &mut self,
        chunk: &Chunk,
        idxs: &[usize],
        tests: &mut [TestRun],
        errors: &mut Vec<DispatchError>,
    ) {
        let mut share: Vec<(JobShareKey, Vec<usize>)> = Vec::new();
        let mut flex: Vec<usize> = Vec::new();
        let mut indep: Vec<usize> = Vec::new();

        for &idx in idxs {
            let config = &tests[idx].config;
            if config.share_allocation != ShareMode::No {
                let key = JobShareKey::new(config, calc_node_range(config, chunk.len()));
                match share.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, group)) => group.push(idx),
                    None => share.push((key, vec![idx])),
                }
            } else if config.flex_scheduled() {
                flex.push(idx);
            } else {
                indep.push(idx);
            }
        }

        // A group of one gains nothing from sharing; demote it to the lane
        // it would otherwise use.
        for (key, group) in share {
            if group.len() == 1 {
                let idx = group[0];
                if tests[idx].config.flex_scheduled() {
                    flex.push(idx);
                } else {
                    indep.push(idx);
                }
            } else {
                self.dispatch_shared(chunk, &key, &group, tests, errors);
            }
        }

        flex.sort_unstable();
        indep.sort_unstable();
        for idx in flex {
            self.dispatch_flex(chunk, idx, tests, errors);
        }
        if !indep.is_empty() {
            self.dispatch_independent(chunk, &indep, tests, errors);
        }
    }

    /// One (or a few) allocations covering a whole share group.
    fn dispatch_shared(
        &mut self,
        chunk: &Chunk,
        key: &JobShareKey,
        group: &[usize],
        tests: &mut [TestRun],
        errors: &mut Vec<DispatchError>,
    ) {
        // The allocation must fit the hungriest test in the group, capped at
        // the chunk itself.
        let mut shared_nodes = 1usize;
        for &idx in group {
            let range = calc_node_range(&tests[idx].config, chunk.len());
            let mut needed = range.max.unwrap_or(chunk.len() as u64) as usize;
            if needed > chunk.len() {
                tests[idx].status.set(
                    RunState::SchedWarning,
                    format!(
                        "Requested {needed} nodes, but the chunk only has {}",
                        chunk.len()
                    ),
                );
                needed = chunk.len();
            }
            shared_nodes = shared_nodes.max(needed);
        }

        let config = tests[group[0]].config.clone();
        if config.share_allocation == ShareMode::Max {
            shared_nodes = chunk.len();
        }
        // The allocation's walltime covers the longest test in this group.
        let time_limit = group
            .iter()
            .filter_map(|&idx| tests[idx].config.time_limit)
            .max();

        match (config.chunking.enabled(), key.node_range.max) {
            // Chunked: pin the allocation to a head slice of the chunk.
            (true, _) => {
                let alloc_nodes: NodeList = chunk.nodes()[..shared_nodes].to_vec();
                let target = AllocTarget::Nodes(alloc_nodes.clone());
                self.dispatch_alloc(
                    group,
                    target,
                    &config,
                    time_limit,
                    Some(&alloc_nodes),
                    tests,
                    errors,
                );
            }
            // Unbounded range or max-share: one allocation for the group,
            // sized by the backend.
            (false, None) => {
                self.dispatch_alloc(
                    group,
                    AllocTarget::Range(key.node_range),
                    &config,
                    time_limit,
                    None,
                    tests,
                    errors,
                );
            }
            (false, Some(_)) if config.share_allocation == ShareMode::Max => {
                self.dispatch_alloc(
                    group,
                    AllocTarget::Range(key.node_range),
                    &config,
                    time_limit,
                    None,
                    tests,
                    errors,
                );
            }
            // Unchunked with a bounded size: spread the group over enough
            // allocations to cover the chunk, round-robin.
            (false, Some(max_nodes)) => {
                let max_nodes = (max_nodes as usize).max(1);
                let bins = chunk.len().div_ceil(max_nodes).clamp(1, group.len());
                let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); bins];
                for (pos, &idx) in group.iter().enumerate() {
                    buckets[pos % bins].push(idx);
                }
                for bucket in buckets {
                    self.dispatch_alloc(
                        &bucket,
                        AllocTarget::Range(key.node_range),
                        &config,
                        time_limit,
                        None,
                        tests,
                        errors,
                    );
                }
            }
        }
    }

    /// One allocation for one flexibly scheduled test. The backend picks the
    /// nodes; the snapshot covers the whole chunk since any of its nodes may
    /// be handed to the job.
    fn dispatch_flex(
        &mut self,
        chunk: &Chunk,
        idx: usize,
        tests: &mut [TestRun],
        errors: &mut Vec<DispatchError>,
    ) {
        let config = tests[idx].config.clone();
        let range = calc_node_range(&config, chunk.len());
        self.dispatch_alloc(
            &[idx],
            AllocTarget::Range(range),
            &config,
            config.time_limit,
            Some(chunk.nodes()),
            tests,
            errors,
        );
    }

    /// Node-pinned allocations, one per test. Tests are laid out across the
    /// chunk smallest-need first; when the chunk runs out, the layout wraps
    /// back to its start.
    fn dispatch_independent(
        &mut self,
        chunk: &Chunk,
        idxs: &[usize],
        tests: &mut [TestRun],
        errors: &mut Vec<DispatchError>,
    ) {
        let mut needs: Vec<(usize, usize)> = Vec::with_capacity(idxs.len());
        for &idx in idxs {
            let range = calc_node_range(&tests[idx].config, chunk.len());
            let mut needed = range.max.unwrap_or(chunk.len() as u64) as usize;
            if needed > chunk.len() {
                tests[idx].status.set(
                    RunState::SchedWarning,
                    format!(
                        "Requested {needed} nodes, but the chunk only has {}",
                        chunk.len()
                    ),
                );
                needed = chunk.len();
            }
            needs.push((idx, needed.max(1)));
        }
        needs.sort_unstable_by_key(|&(idx, needed)| (needed, idx));

        let all = chunk.nodes();
        let mut offset = 0;
        for (idx, needed) in needs {
            if offset + needed > all.len() {
                offset = 0;
            }
            let nodes: NodeList = all[offset..offset + needed].to_vec();
            offset += needed;

            let config = tests[idx].config.clone();
            self.dispatch_alloc(
                &[idx],
                AllocTarget::Nodes(nodes.clone()),
                &config,
                config.time_limit,
                Some(&nodes),
                tests,
                errors,
            );
        }
    }

    /// Basic path: no inventory, so allocations are sized purely by node
    /// range against the policy's `cluster_info`. Sharing still applies.
    fn schedule_by_range(&mut self, tests: &mut [TestRun], errors: &mut Vec<DispatchError>) {
        let mut share: Vec<(JobShareKey, Vec<usize>)> = Vec::new();
        let mut alone: Vec<usize> = Vec::new();

        for idx in 0..tests.len() {
            let test = &mut tests[idx];
            if let Err(error) = self.prepare_test(test) {
                fail_test(test, &error);
                errors.push(DispatchError {
                    tests: vec![test.id],
                    error,
                });
                continue;
            }

            let available = test.config.cluster_info.node_count.unwrap_or(1);
            let range = calc_node_range(&test.config, available);
            if test.config.share_allocation == ShareMode::No {
                alone.push(idx);
            } else {
                let key = JobShareKey::new(&test.config, range);
                match share.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, group)) => group.push(idx),
                    None => share.push((key, vec![idx])),
                }
            }
        }

        for (key, group) in share {
            if group.len() == 1 {
                alone.push(group[0]);
                continue;
            }
            let config = tests[group[0]].config.clone();
            let time_limit = group
                .iter()
                .filter_map(|&idx| tests[idx].config.time_limit)
                .max();
            self.dispatch_alloc(
                &group,
                AllocTarget::Range(key.node_range),
                &config,
                time_limit,
                None,
                tests,
                errors,
            );
        }

        alone.sort_unstable();
        for idx in alone {
            let config = tests[idx].config.clone();
            let available = config.cluster_info.node_count.unwrap_or(1);
            let range = calc_node_range(&config, available);
            self.dispatch_alloc(
                &[idx],
                AllocTarget::Range(range),
                &config,
                config.time_limit,
                None,
                tests,
                errors,
            );
        }
    }

    /// Create a job for `group`, snapshot node data when the nodes are
    /// known, submit through the backend, and record SCHEDULED on every
    /// covered test.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_alloc(
        &mut self,
        group: &[usize],
        target: AllocTarget,
        config: &ScheduleConfig,
        time_limit: Option<Duration>,
        pinned: Option<&[NodeName]>,
        tests: &mut [TestRun],
        errors: &mut Vec<DispatchError>,
    ) {
        if group.is_empty() {
            return;
        }

        let full_ids: Vec<String> = group.iter().map(|&idx| tests[idx].full_id()).collect();
        let name_refs: Vec<&str> = full_ids.iter().map(String::as_str).collect();
        let job_name = compose_job_name("gantry", &name_refs);

        let mut job = match self.new_job(job_name) {
            Ok(job) => job,
            Err(error) => {
                errors.push(DispatchError {
                    tests: test_ids(tests, group),
                    error: error.into(),
                });
                return;
            }
        };

        if let Some(nodes) = pinned {
            let data = self.node_data_for(nodes);
            if let Err(error) = job.save_node_data(&data) {
                errors.push(DispatchError {
                    tests: test_ids(tests, group),
                    error: error.into(),
                });
                return;
            }
        }

        let request = AllocRequest {
            job_name: job.name.clone(),
            target,
            config,
            time_limit,
        };
        match self.backend.kickoff(&job, &request) {
            Ok(info) => {
                log::debug!(
                    "Job '{}' kicked off as {} covering {} test(s)",
                    job.name,
                    info.id,
                    group.len()
                );
                job.info = Some(info);
                let job_id = job.id;
                self.jobs.insert(job_id, job);
                for &idx in group {
                    tests[idx].job = Some(job_id);
                    tests[idx]
                        .status
                        .set(RunState::Scheduled, format!("assigned to job {job_id}"));
                }
            }
            Err(error) => {
                let error = SchedulerError::from(error);
                for &idx in group {
                    fail_test(&mut tests[idx], &error);
                }
                errors.push(DispatchError {
                    tests: test_ids(tests, group),
                    error,
                });
            }
        }
    }

    fn node_data_for(&self, nodes: &[NodeName]) -> Map<NodeName, Node> {
        let mut data = Map::default();
        if let Some(inventory) = &self.nodes {
            for name in nodes {
                if let Some(node) = inventory.get(name) {
                    data.insert(name.clone(), node.clone());
                }
            }
        }
        data
    }
}
