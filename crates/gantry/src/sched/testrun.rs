//! The build-complete test handle the engine consumes. The full test-run
//! machinery (build state, results, series membership) lives in the harness;
//! the scheduler only needs the policy, a status record, and the job link.

use serde::{Deserialize, Serialize};

use crate::sched::config::ScheduleConfig;
use crate::sched::job::JobId;
use crate::sched::nodes::NodeListId;
use crate::sched::status::StatusHistory;

pub type TestId = u32;

/// Which chunk of the policy's chunk group a test wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChunkSpec {
    /// Pick the least-used chunk.
    #[default]
    Any,
    /// Pin to a specific chunk index; out of range is a dispatch error.
    Index(usize),
}

#[derive(Debug)]
pub struct TestRun {
    pub id: TestId,
    pub name: String,
    pub config: ScheduleConfig,
    pub chunk_spec: ChunkSpec,
    /// Which filtered node list this test schedules against; assigned when
    /// the plugin prepares the test.
    pub node_list_id: Option<NodeListId>,
    pub status: StatusHistory,
    /// The allocation covering this test, owned by the dispatching plugin.
    pub job: Option<JobId>,
}

impl TestRun {
    pub fn new(id: TestId, name: impl Into<String>, config: ScheduleConfig) -> Self {
        TestRun {
            id,
            name: name.into(),
            config,
            chunk_spec: ChunkSpec::Any,
            node_list_id: None,
            status: StatusHistory::new(),
            job: None,
        }
    }

    /// Unique, human-readable id used in job names and error reports.
    pub fn full_id(&self) -> String {
        format!("{}.{}", self.name, self.id)
    }
}
