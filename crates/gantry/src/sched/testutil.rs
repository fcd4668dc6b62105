//! Shared test scaffolding: a scriptable in-memory backend and plugin
//! constructors around it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Value, json};

use crate::sched::backend::{
    AdvancedBackend, AllocRequest, AllocTarget, Backend, BackendJobStatus, BackendResult,
    BasicBackend, RawNodeData,
};
use crate::sched::config::ScheduleConfig;
use crate::sched::job::{Job, JobInfo};
use crate::sched::nodes::{Node, NodeList};
use crate::sched::{PRIO_CORE, SchedulerPlugin};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KickoffRecord {
    pub job_name: String,
    pub target: AllocTarget,
    pub time_limit: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct StubState {
    pub node_count: usize,
    /// Node names reported as down by the fake inventory.
    pub down: Vec<String>,
    pub raw_node_data_calls: u32,
    pub kickoff_calls: u32,
    pub status_calls: u32,
    pub kickoffs: Vec<KickoffRecord>,
    /// Scripted status responses, oldest first; an empty script reports the
    /// job as queued.
    pub statuses: VecDeque<Result<Option<BackendJobStatus>, String>>,
    pub fail_kickoff: bool,
    pub cancel_reason: Option<String>,
}

pub(crate) struct StubBackend {
    pub state: Rc<RefCell<StubState>>,
}

pub(crate) fn node_name(index: usize) -> String {
    format!("n{index:02}")
}

impl BasicBackend for StubBackend {
    fn label(&self) -> &str {
        "stub"
    }

    fn kickoff(&mut self, _job: &Job, request: &AllocRequest) -> BackendResult<JobInfo> {
        let mut state = self.state.borrow_mut();
        state.kickoff_calls += 1;
        if state.fail_kickoff {
            return Err(anyhow!("the batch system is on fire"));
        }
        state.kickoffs.push(KickoffRecord {
            job_name: request.job_name.clone(),
            target: request.target.clone(),
            time_limit: request.time_limit,
        });
        Ok(JobInfo {
            id: format!("stub-{}", state.kickoff_calls),
            host: None,
        })
    }

    fn alloc_nodes(&self, _job: &Job) -> BackendResult<NodeList> {
        let state = self.state.borrow();
        Ok((0..state.node_count).map(node_name).collect())
    }

    fn job_status(&mut self, _info: &JobInfo) -> BackendResult<Option<BackendJobStatus>> {
        let mut state = self.state.borrow_mut();
        state.status_calls += 1;
        match state.statuses.pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Some(BackendJobStatus::Queued)),
        }
    }

    fn cancel(&mut self, _info: &JobInfo) -> Option<String> {
        self.state.borrow().cancel_reason.clone()
    }
}

impl AdvancedBackend for StubBackend {
    fn raw_node_data(&mut self, _config: &ScheduleConfig) -> BackendResult<RawNodeData> {
        let mut state = self.state.borrow_mut();
        state.raw_node_data_calls += 1;
        let nodes = (0..state.node_count)
            .map(|index| json!({"name": node_name(index)}))
            .collect();
        Ok((nodes, Value::Null))
    }

    fn transform(
        &self,
        _config: &ScheduleConfig,
        raw: &Value,
        _extra: &Value,
    ) -> BackendResult<Node> {
        let name = raw["name"]
            .as_str()
            .ok_or_else(|| anyhow!("bad stub node"))?
            .to_string();
        let up = !self.state.borrow().down.contains(&name);
        Ok(Node {
            name: name.clone(),
            up,
            available: up,
            cpus: Some(16),
            mem_bytes: Some(64 << 30),
            partitions: vec!["standard".into()],
            ..Default::default()
        })
    }
}

fn stub_state(node_count: usize) -> Rc<RefCell<StubState>> {
    Rc::new(RefCell::new(StubState {
        node_count,
        ..Default::default()
    }))
}

/// An advanced-backend plugin over `node_count` fake nodes, with a handle to
/// the backend's state.
pub(crate) fn stub_plugin(
    node_count: usize,
    dir: &Path,
) -> (SchedulerPlugin, Rc<RefCell<StubState>>) {
    let state = stub_state(node_count);
    let backend = Backend::Advanced(Box::new(StubBackend {
        state: Rc::clone(&state),
    }));
    let mut plugin = SchedulerPlugin::new(
        "stub",
        "fake advanced scheduler",
        PRIO_CORE,
        backend,
        dir.to_path_buf(),
    );
    plugin.seed_rng(0xda7a);
    (plugin, state)
}

/// A basic-backend plugin; no inventory, range targets only.
pub(crate) fn stub_basic_plugin(dir: &Path) -> (SchedulerPlugin, Rc<RefCell<StubState>>) {
    let state = stub_state(0);
    let backend = Backend::Basic(Box::new(StubBackend {
        state: Rc::clone(&state),
    }));
    let mut plugin = SchedulerPlugin::new(
        "stub_basic",
        "fake basic scheduler",
        PRIO_CORE,
        backend,
        dir.to_path_buf(),
    );
    plugin.seed_rng(0xda7a);
    (plugin, state)
}
