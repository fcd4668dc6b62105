//! The contract between the scheduler engine and a concrete batch system.
//!
//! A backend comes in exactly two capability variants. *Advanced* backends
//! can enumerate the cluster's nodes, which unlocks filtering, chunking and
//! node-pinned allocations. *Basic* backends cannot; the engine only hands
//! them node ranges and relies on `cluster_info` from the policy. The split
//! is a sum type rather than a class hierarchy, so a missing hook is a
//! compile-time error instead of a runtime surprise.

pub mod local;
pub mod slurm;

use std::time::Duration;

use crate::sched::config::{NodeRange, ScheduleConfig};
use crate::sched::job::{Job, JobInfo};
use crate::sched::nodes::{Node, NodeList};

pub type BackendResult<T> = anyhow::Result<T>;

/// Raw, backend-native node data: one opaque value per node, plus one value
/// that applies to every node.
pub type RawNodeData = (Vec<serde_json::Value>, serde_json::Value);

/// The engine's structured decision about one allocation. Backends render
/// this into their native submission syntax; the engine never composes
/// scheduler-specific script headers itself.
#[derive(Debug, Clone)]
pub struct AllocRequest<'a> {
    pub job_name: String,
    pub target: AllocTarget,
    pub config: &'a ScheduleConfig,
    /// Effective time limit; for shared allocations this is the maximum
    /// across the grouped tests.
    pub time_limit: Option<Duration>,
}

/// Either a pinned set of nodes or a range the backend resolves itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocTarget {
    Nodes(NodeList),
    Range(NodeRange),
}

impl AllocTarget {
    pub fn node_count(&self) -> Option<u64> {
        match self {
            AllocTarget::Nodes(nodes) => Some(nodes.len() as u64),
            AllocTarget::Range(range) => range.max,
        }
    }
}

/// Native job state as reported by a backend. `None` from a status hook means
/// the scheduler no longer knows the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendJobStatus {
    Queued,
    Running,
    Failed(String),
    Cancelled(String),
}

/// Hooks every backend must provide, advanced or not.
pub trait BasicBackend {
    fn label(&self) -> &str;

    /// Whether this backend can actually submit jobs on the current host.
    fn available(&self) -> bool {
        true
    }

    /// Submit one allocation for the given request. The job's working area
    /// and kickoff script already exist.
    fn kickoff(&mut self, job: &Job, request: &AllocRequest) -> BackendResult<JobInfo>;

    /// Which nodes a submission actually received, once it is running.
    fn alloc_nodes(&self, job: &Job) -> BackendResult<NodeList>;

    fn job_status(&mut self, info: &JobInfo) -> BackendResult<Option<BackendJobStatus>>;

    /// Best-effort termination. `None` on success, otherwise a human-readable
    /// reason (already finished, permission denied, host mismatch, ...).
    fn cancel(&mut self, info: &JobInfo) -> Option<String>;
}

/// Backends that can enumerate nodes. Everything from [`BasicBackend`], plus
/// inventory acquisition and an optional extra filter predicate.
pub trait AdvancedBackend: BasicBackend {
    /// Fetch raw data for every node on the cluster.
    fn raw_node_data(&mut self, config: &ScheduleConfig) -> BackendResult<RawNodeData>;

    /// Turn one raw node entry into the generic node representation. Must
    /// fill in at least the name and up/available state.
    fn transform(
        &self,
        config: &ScheduleConfig,
        raw: &serde_json::Value,
        extra: &serde_json::Value,
    ) -> BackendResult<Node>;

    /// Backend-specific filter predicate; a returned string is the rejection
    /// reason.
    fn custom_filter(&self, config: &ScheduleConfig, name: &str, node: &Node) -> Option<String> {
        let _ = (config, name, node);
        None
    }
}

/// A backend with its capability made explicit.
pub enum Backend {
    Basic(Box<dyn BasicBackend>),
    Advanced(Box<dyn AdvancedBackend>),
}

impl Backend {
    pub fn label(&self) -> &str {
        match self {
            Backend::Basic(backend) => backend.label(),
            Backend::Advanced(backend) => backend.label(),
        }
    }

    pub fn available(&self) -> bool {
        match self {
            Backend::Basic(backend) => backend.available(),
            Backend::Advanced(backend) => backend.available(),
        }
    }

    pub fn kickoff(&mut self, job: &Job, request: &AllocRequest) -> BackendResult<JobInfo> {
        match self {
            Backend::Basic(backend) => backend.kickoff(job, request),
            Backend::Advanced(backend) => backend.kickoff(job, request),
        }
    }

    pub fn alloc_nodes(&self, job: &Job) -> BackendResult<NodeList> {
        match self {
            Backend::Basic(backend) => backend.alloc_nodes(job),
            Backend::Advanced(backend) => backend.alloc_nodes(job),
        }
    }

    pub fn job_status(&mut self, info: &JobInfo) -> BackendResult<Option<BackendJobStatus>> {
        match self {
            Backend::Basic(backend) => backend.job_status(info),
            Backend::Advanced(backend) => backend.job_status(info),
        }
    }

    pub fn cancel(&mut self, info: &JobInfo) -> Option<String> {
        match self {
            Backend::Basic(backend) => backend.cancel(info),
            Backend::Advanced(backend) => backend.cancel(info),
        }
    }

    pub fn as_advanced(&mut self) -> Option<&mut Box<dyn AdvancedBackend>> {
        match self {
            Backend::Advanced(backend) => Some(backend),
            Backend::Basic(_) => None,
        }
    }

    pub fn is_advanced(&self) -> bool {
        matches!(self, Backend::Advanced(_))
    }
}
