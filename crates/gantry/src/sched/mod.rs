//! The scheduler resource-allocation engine.
//!
//! A [`SchedulerPlugin`] wraps one backend (Slurm, local execution, ...) and
//! owns all per-backend state: the node inventory, the filtered-node-list
//! arena, the chunk cache and the job-status cache. One plugin instance is
//! driven from a single control thread; everything takes `&mut self`, so the
//! "callers must serialize access" contract is enforced by the borrow
//! checker rather than by locks.

pub mod backend;
pub mod chunking;
pub mod config;
mod dispatch;
pub mod job;
pub mod nodes;
pub mod status;
pub mod testrun;

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use thiserror::Error;

use crate::Map;
use crate::sched::backend::Backend;
use crate::sched::chunking::{Chunk, ChunkGroupKey, partition_chunks};
use crate::sched::config::{ScheduleConfig, SchedConfigError, calc_node_range};
use crate::sched::job::{Job, JobError, JobId};
use crate::sched::nodes::{FilterReasons, NodeInventory, NodeListArena, NodeListId, filter_nodes};
use crate::sched::status::StatusInfo;
use crate::sched::testrun::{TestId, TestRun};

pub use dispatch::DispatchError;

/// The filtered node pool cannot satisfy the policy's minimum node count.
/// Fatal for every test under the policy.
#[derive(Debug)]
pub struct InsufficientNodes {
    pub needed: u64,
    pub found: usize,
    pub reasons: FilterReasons,
}

impl fmt::Display for InsufficientNodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insufficient nodes: the schedule needs at least {} but only {} remained \
             after filtering. Nodes were filtered for these reasons:\n{}",
            self.needed, self.found, self.reasons
        )
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Error validating schedule config: {0}")]
    Config(#[from] SchedConfigError),
    #[error("{0}")]
    InsufficientNodes(InsufficientNodes),
    #[error(
        "Node '{node}' was requested via include_nodes, but filtering removed it:\n{reasons}"
    )]
    IncludeNodeFiltered { node: String, reasons: FilterReasons },
    #[error("Test selected chunk {index}, but only {available} chunks exist for this policy")]
    ChunkOutOfRange { index: usize, available: usize },
    #[error("Scheduler '{0}' has no node inventory; tests must be scheduled by node range")]
    NoInventory(String),
    #[error("Job error: {0}")]
    Job(#[from] JobError),
    #[error("Backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
    #[error("A scheduler named '{name}' is already registered at priority {priority}")]
    RegistryConflict { name: String, priority: u8 },
    #[error("Scheduler plugin not found: '{0}'")]
    UnknownPlugin(String),
}

/// Registration priorities, low to high.
pub const PRIO_CORE: u8 = 0;
pub const PRIO_COMMON: u8 = 10;
pub const PRIO_USER: u8 = 20;

pub struct SchedulerPlugin {
    name: String,
    description: String,
    priority: u8,
    pub(crate) backend: Backend,
    /// Root under which job working areas are created.
    working_dir: PathBuf,
    /// Node inventory, fetched lazily and kept for the plugin's lifetime.
    pub(crate) nodes: Option<NodeInventory>,
    pub(crate) node_lists: NodeListArena,
    pub(crate) chunk_sets: Map<ChunkGroupKey, Vec<Chunk>>,
    /// Per-chunk use counts, for least-used chunk selection.
    pub(crate) chunk_usage: Map<ChunkGroupKey, Vec<u64>>,
    pub(crate) jobs: Map<JobId, Job>,
    next_job_id: JobId,
    pub(crate) job_statuses: Map<JobId, (Instant, StatusInfo)>,
    pub(crate) rng: SmallRng,
}

impl SchedulerPlugin {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        priority: u8,
        backend: Backend,
        working_dir: PathBuf,
    ) -> Self {
        SchedulerPlugin {
            name: name.into(),
            description: description.into(),
            priority,
            backend,
            working_dir,
            nodes: None,
            node_lists: NodeListArena::default(),
            chunk_sets: Map::default(),
            chunk_usage: Map::default(),
            jobs: Map::default(),
            next_job_id: 1,
            job_statuses: Map::default(),
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Fix the RNG seed used by the random selection algorithms, for
    /// reproducible partitionings.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn available(&self) -> bool {
        self.backend.available()
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    pub fn get_job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// The generic node inventory, or `None` when the backend cannot
    /// enumerate nodes (basic mode). Built once; acquisition shells out to
    /// the real batch system, so the result is kept until an explicit
    /// [`SchedulerPlugin::refresh_inventory`].
    pub fn inventory(
        &mut self,
        config: &ScheduleConfig,
    ) -> Result<Option<&NodeInventory>, SchedulerError> {
        let backend = match self.backend.as_advanced() {
            Some(backend) => backend,
            None => return Ok(None),
        };

        if self.nodes.is_none() {
            let (raw_nodes, extra) = backend.raw_node_data(config)?;
            let mut inventory = NodeInventory::default();
            for raw in &raw_nodes {
                let node = backend.transform(config, raw, &extra)?;
                inventory.insert(node.name.clone(), node);
            }
            log::debug!(
                "Scheduler '{}' found {} nodes",
                self.name,
                inventory.len()
            );
            self.nodes = Some(inventory);
        }

        Ok(self.nodes.as_ref())
    }

    /// Throw away the inventory and everything derived from it. Node-list
    /// ids and chunk groups are invalidated wholesale; this is the only way
    /// the inventory changes.
    pub fn refresh_inventory(&mut self) {
        self.nodes = None;
        self.node_lists.clear();
        self.chunk_sets.clear();
        self.chunk_usage.clear();
    }

    /// Validate a test's policy and, for advanced backends, resolve the
    /// filtered node list and chunk group it schedules against.
    pub fn prepare_test(&mut self, test: &mut TestRun) -> Result<(), SchedulerError> {
        test.config.validate()?;

        if !self.backend.is_advanced() {
            return Ok(());
        }

        let node_list_id = self.filtered_node_list(&test.config)?;
        test.node_list_id = Some(node_list_id);

        // Warm the chunk cache so dispatch never recomputes it.
        self.ensure_chunks(node_list_id, &test.config)?;
        Ok(())
    }

    /// Filter the inventory for one policy and intern the result in the
    /// node-list arena. Identical filtered lists share one id.
    fn filtered_node_list(
        &mut self,
        config: &ScheduleConfig,
    ) -> Result<NodeListId, SchedulerError> {
        self.inventory(config)?;
        let inventory = match &self.nodes {
            Some(nodes) => nodes,
            None => return Err(SchedulerError::NoInventory(self.name.clone())),
        };
        let backend = match &self.backend {
            Backend::Advanced(backend) => backend,
            Backend::Basic(_) => unreachable!("checked by inventory()"),
        };

        let (filtered, reasons) = filter_nodes(inventory, config, |name, node| {
            backend.custom_filter(config, name, node)
        });

        if let Some(node) = config
            .include_nodes
            .iter()
            .find(|node| !filtered.contains(node))
        {
            return Err(SchedulerError::IncludeNodeFiltered {
                node: node.clone(),
                reasons,
            });
        }

        let range = calc_node_range(config, filtered.len());
        if (filtered.len() as u64) < range.min {
            return Err(SchedulerError::InsufficientNodes(InsufficientNodes {
                needed: range.min,
                found: filtered.len(),
                reasons,
            }));
        }

        Ok(self.node_lists.intern(filtered))
    }

    /// Get (or lazily compute) the chunks for one policy against one
    /// filtered node list. Memoized by [`ChunkGroupKey`]; chunk membership
    /// never changes once computed.
    pub fn get_chunks(
        &mut self,
        node_list_id: NodeListId,
        config: &ScheduleConfig,
    ) -> Result<&[Chunk], SchedulerError> {
        let key = self.ensure_chunks(node_list_id, config)?;
        Ok(self.chunk_sets[&key].as_slice())
    }

    pub(crate) fn ensure_chunks(
        &mut self,
        node_list_id: NodeListId,
        config: &ScheduleConfig,
    ) -> Result<ChunkGroupKey, SchedulerError> {
        let node_list = self
            .node_lists
            .get(node_list_id)
            .ok_or_else(|| SchedulerError::NoInventory(self.name.clone()))?;

        let key = ChunkGroupKey::new(node_list_id, config, node_list.len());
        if !self.chunk_sets.contains_key(&key) {
            let chunks = partition_chunks(node_list, &key, &mut self.rng);
            log::debug!(
                "Scheduler '{}' partitioned node list {} into {} chunks of {}",
                self.name,
                node_list_id,
                chunks.len(),
                key.chunk_size,
            );
            self.chunk_usage.insert(key.clone(), vec![0; chunks.len()]);
            self.chunk_sets.insert(key.clone(), chunks);
        }
        Ok(key)
    }

    /// Allocate the next engine-internal job id and create its working area.
    pub(crate) fn new_job(&mut self, name: String) -> Result<Job, JobError> {
        let id = self.next_job_id;
        self.next_job_id += 1;
        Job::new(&self.working_dir, id, name)
    }
}

/// Explicit registry of active scheduler plugins. Built by process startup
/// code through ordered [`SchedulerRegistry::register`] calls; dropped (or
/// [`SchedulerRegistry::clear`]ed) at teardown. There is no global state and
/// no load-time side effect.
#[derive(Default)]
pub struct SchedulerRegistry {
    plugins: Map<String, SchedulerPlugin>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. A higher-priority plugin of the same name replaces
    /// a lower-priority one; registering at the priority already held by the
    /// name is a conflict.
    ///
    /// Returns the plugin that lost out: the displaced incumbent (which may
    /// still own in-flight jobs the caller wants to drain) or the ignored
    /// newcomer.
    pub fn register(
        &mut self,
        plugin: SchedulerPlugin,
    ) -> Result<Option<SchedulerPlugin>, SchedulerError> {
        match self.plugins.get(plugin.name()) {
            None => {
                self.plugins.insert(plugin.name().to_string(), plugin);
                Ok(None)
            }
            Some(existing) if existing.priority == plugin.priority => {
                Err(SchedulerError::RegistryConflict {
                    name: plugin.name().to_string(),
                    priority: plugin.priority,
                })
            }
            Some(existing) if existing.priority > plugin.priority => {
                log::debug!(
                    "Ignoring scheduler '{}' at priority {}; priority {} is active",
                    plugin.name(),
                    plugin.priority,
                    existing.priority
                );
                Ok(Some(plugin))
            }
            Some(existing) => {
                log::debug!(
                    "Scheduler '{}' at priority {} replaces priority {}",
                    plugin.name(),
                    plugin.priority,
                    existing.priority
                );
                Ok(self.plugins.insert(plugin.name().to_string(), plugin))
            }
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut SchedulerPlugin, SchedulerError> {
        self.plugins
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownPlugin(name.to_string()))
    }

    /// Remove one plugin, returning it so in-flight jobs can be drained.
    pub fn deactivate(&mut self, name: &str) -> Option<SchedulerPlugin> {
        self.plugins.remove(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn clear(&mut self) {
        self.plugins.clear();
    }
}

/// Collect the ids of a set of tests, for error reporting.
pub(crate) fn test_ids(tests: &[TestRun], idxs: &[usize]) -> Vec<TestId> {
    idxs.iter().map(|&idx| tests[idx].id).collect()
}

#[cfg(test)]
pub(crate) mod testutil;
