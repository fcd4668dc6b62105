//! Job handles. A job is created per allocation request and owned by the
//! dispatching plugin; tests reference it by id. The working area holds the
//! kickoff script, its log, and the node-data snapshot used later for
//! deferred-variable resolution.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Map;
use crate::sched::nodes::{Node, NodeName};

pub type JobId = u32;

pub const KICKOFF_SCRIPT_FN: &str = "kickoff.sh";
pub const KICKOFF_LOG_FN: &str = "kickoff.log";
pub const NODE_DATA_FN: &str = "node_data.json";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Could not create job working area at {path}: {source}")]
    Workdir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not save job node data: {0}")]
    SaveNodeData(#[source] anyhow::Error),
    #[error("Could not load job node data: {0}")]
    LoadNodeData(#[source] anyhow::Error),
}

/// Backend-native identification of a submitted allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Native job id (Slurm job id, pid, ...).
    pub id: String,
    /// Host the job was submitted from, for backends where that matters.
    pub host: Option<String>,
}

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    workdir: PathBuf,
    /// Filled in after a successful kickoff.
    pub info: Option<JobInfo>,
}

impl Job {
    /// Create the job working area under `root` and return the handle.
    pub fn new(root: &Path, id: JobId, name: String) -> Result<Job, JobError> {
        let workdir = root.join(format!("job.{id}"));
        std::fs::create_dir_all(&workdir).map_err(|source| JobError::Workdir {
            path: workdir.clone(),
            source,
        })?;
        Ok(Job {
            id,
            name,
            workdir,
            info: None,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn kickoff_path(&self) -> PathBuf {
        self.workdir.join(KICKOFF_SCRIPT_FN)
    }

    pub fn kickoff_log(&self) -> PathBuf {
        self.workdir.join(KICKOFF_LOG_FN)
    }

    /// Snapshot the node data a test was given, so that deferred variables
    /// can be resolved later inside the allocation.
    pub fn save_node_data(&self, nodes: &Map<NodeName, Node>) -> Result<(), JobError> {
        let path = self.workdir.join(NODE_DATA_FN);
        let file = File::create(&path)
            .map_err(|err| JobError::SaveNodeData(err.into()))?;
        serde_json::to_writer(BufWriter::new(file), nodes)
            .map_err(|err| JobError::SaveNodeData(err.into()))
    }

    pub fn load_node_data(&self) -> Result<Map<NodeName, Node>, JobError> {
        let path = self.workdir.join(NODE_DATA_FN);
        let file = File::open(&path)
            .map_err(|err| JobError::LoadNodeData(err.into()))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|err| JobError::LoadNodeData(err.into()))
    }
}
