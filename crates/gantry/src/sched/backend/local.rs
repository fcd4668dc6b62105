//! Local backend: "allocations" are plain child processes on the current
//! host. Used on unclustered machines and as the harness's fallback when no
//! batch system is around.

use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::Map;
use crate::sched::backend::{
    AllocRequest, BackendJobStatus, BackendResult, BasicBackend,
};
use crate::sched::job::{Job, JobInfo};
use crate::sched::nodes::NodeList;

/// How long a SIGTERM'd process gets to exit before the cancel is reported
/// as refused.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

pub struct LocalBackend {
    /// Shell command the kickoff script runs.
    run_cmd: String,
    /// Children we spawned ourselves, by pid, so they can be reaped.
    children: Map<u32, Child>,
    /// Terminal results of already-reaped children, so later status polls
    /// still see them.
    finished: Map<u32, Option<BackendJobStatus>>,
}

impl LocalBackend {
    pub fn new(run_cmd: impl Into<String>) -> Self {
        LocalBackend {
            run_cmd: run_cmd.into(),
            children: Map::default(),
            finished: Map::default(),
        }
    }

    fn reap(&mut self, pid: u32, status: ExitStatus) -> Option<BackendJobStatus> {
        self.children.remove(&pid);
        let result = if status.success() {
            None
        } else if let Some(signal) = status.signal() {
            Some(BackendJobStatus::Cancelled(format!(
                "process was killed by signal {signal}"
            )))
        } else {
            Some(BackendJobStatus::Failed(format!(
                "process exited with code {}",
                status.code().unwrap_or(-1)
            )))
        };
        self.finished.insert(pid, result.clone());
        result
    }
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn parse_pid(info: &JobInfo) -> BackendResult<i32> {
    info.id
        .parse()
        .map_err(|_| anyhow!("'{}' is not a process id", info.id))
}

impl BasicBackend for LocalBackend {
    fn label(&self) -> &str {
        "local"
    }

    fn kickoff(&mut self, job: &Job, request: &AllocRequest) -> BackendResult<JobInfo> {
        let path = job.kickoff_path();
        std::fs::write(&path, format!("#!/bin/bash\n\n{}\n", self.run_cmd))
            .with_context(|| format!("Could not write kickoff script {}", path.display()))?;

        let log = File::create(job.kickoff_log())
            .with_context(|| format!("Could not open log for job {}", job.id))?;
        let child = Command::new("sh")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(log.try_clone().context("Could not clone log handle")?)
            .stderr(log)
            .spawn()
            .with_context(|| format!("Could not start job '{}'", request.job_name))?;

        let pid = child.id();
        self.children.insert(pid, child);
        Ok(JobInfo {
            id: pid.to_string(),
            host: Some(hostname()),
        })
    }

    fn alloc_nodes(&self, _job: &Job) -> BackendResult<NodeList> {
        Ok(vec![hostname()])
    }

    fn job_status(&mut self, info: &JobInfo) -> BackendResult<Option<BackendJobStatus>> {
        let pid = parse_pid(info)?;

        if let Some(child) = self.children.get_mut(&(pid as u32)) {
            return match child.try_wait().context("Could not poll child process")? {
                None => Ok(Some(BackendJobStatus::Running)),
                Some(status) => Ok(self.reap(pid as u32, status)),
            };
        }
        if let Some(result) = self.finished.get(&(pid as u32)) {
            return Ok(result.clone());
        }

        // Not one of ours (e.g. the harness restarted); probe the pid.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(Some(BackendJobStatus::Running)),
            Err(nix::errno::Errno::ESRCH) => Ok(None),
            Err(errno) => Err(anyhow!("Could not probe process {pid}: {errno}")),
        }
    }

    fn cancel(&mut self, info: &JobInfo) -> Option<String> {
        if let Some(host) = &info.host {
            let here = hostname();
            if *host != here {
                return Some(format!(
                    "process was started on host '{host}', cannot cancel it from '{here}'"
                ));
            }
        }

        let pid = match parse_pid(info) {
            Ok(pid) => pid,
            Err(error) => return Some(error.to_string()),
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {}
            // A vanished process is already as cancelled as it gets.
            Err(nix::errno::Errno::ESRCH) => return None,
            Err(errno) => return Some(format!("could not signal process {pid}: {errno}")),
        }

        // The signal is only a request; give the process a grace period to
        // actually exit before calling the cancel refused.
        let deadline = Instant::now() + CANCEL_GRACE;
        loop {
            if let Some(child) = self.children.get_mut(&(pid as u32)) {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        self.reap(pid as u32, status);
                        return None;
                    }
                    Ok(None) => {}
                    // Can't poll it anymore; assume the signal landed.
                    Err(_) => return None,
                }
            } else if kill(Pid::from_raw(pid), None) == Err(nix::errno::Errno::ESRCH) {
                return None;
            }

            if Instant::now() >= deadline {
                return Some(format!("process {pid} ignored SIGTERM and refused to die"));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
