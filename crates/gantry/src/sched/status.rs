//! The harness's own status taxonomy for scheduled jobs, and the state
//! machine that maps native scheduler job states into it.

use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::sched::SchedulerPlugin;
use crate::sched::backend::BackendJobStatus;
use crate::sched::testrun::TestRun;

/// Don't query the backend for a job's status more than once per this
/// interval; returns the cached status instead.
pub const JOB_STATUS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// The build finished and the test is waiting to be dispatched.
    Built,
    /// An allocation request covering this test was submitted.
    Scheduled,
    /// The scheduler reports the job as running or about to run.
    SchedStartup,
    /// Scheduled with a caveat (e.g. fewer nodes than requested).
    SchedWarning,
    /// The job died or disappeared without the test completing. Terminal.
    SchedError,
    /// The job was cancelled. Terminal.
    SchedCancelled,
}

impl RunState {
    /// Terminal states are recorded on a test at most once; no further
    /// progress is expected after them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::SchedError | RunState::SchedCancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub state: RunState,
    pub when: SystemTime,
    pub note: String,
}

impl StatusInfo {
    pub fn new(state: RunState, note: impl Into<String>) -> Self {
        StatusInfo {
            state,
            when: SystemTime::now(),
            note: note.into(),
        }
    }
}

/// Append-only status record of one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistory {
    entries: Vec<StatusInfo>,
    complete: bool,
}

impl StatusHistory {
    pub fn new() -> Self {
        StatusHistory {
            entries: vec![StatusInfo::new(RunState::Built, "test handle created")],
            complete: false,
        }
    }

    pub fn set(&mut self, state: RunState, note: impl Into<String>) {
        self.entries.push(StatusInfo::new(state, note));
    }

    pub fn current(&self) -> &StatusInfo {
        // The history always holds at least the initial entry.
        self.entries.last().unwrap()
    }

    pub fn has_state(&self, state: RunState) -> bool {
        self.entries.iter().any(|entry| entry.state == state)
    }

    pub fn entries(&self) -> &[StatusInfo] {
        &self.entries
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl Default for StatusHistory {
    fn default() -> Self {
        StatusHistory::new()
    }
}

impl SchedulerPlugin {
    /// Poll the status of the job backing `test`, translating the backend's
    /// native state into the harness taxonomy.
    ///
    /// Results are cached per job for [`JOB_STATUS_TIMEOUT`] to bound load on
    /// the real scheduler under tight polling loops. The first observation of
    /// a terminal state is recorded on the test and marks the run complete;
    /// repeats are not re-recorded. Backend query failures degrade to the
    /// last known status instead of propagating.
    pub fn job_status(&mut self, test: &mut TestRun) -> StatusInfo {
        let Some(job_id) = test.job else {
            return test.status.current().clone();
        };

        if let Some((stamp, status)) = self.job_statuses.get(&job_id) {
            if stamp.elapsed() < JOB_STATUS_TIMEOUT {
                return status.clone();
            }
        }

        let info = self
            .jobs
            .get(&job_id)
            .and_then(|job| job.info.clone());
        let Some(info) = info else {
            return test.status.current().clone();
        };

        let raw = match self.backend.job_status(&info) {
            Ok(raw) => raw,
            Err(error) => {
                // A status query failure is not a job failure; degrade to the
                // last known status and retry on the next poll.
                log::warn!(
                    "Status query for job {} failed: {error:?}",
                    info.id
                );
                return test.status.current().clone();
            }
        };

        let status = match raw {
            Some(BackendJobStatus::Queued) => {
                StatusInfo::new(RunState::Scheduled, "job is queued")
            }
            Some(BackendJobStatus::Running) => {
                // Normalized startup signal. If the test itself already
                // progressed past SCHEDULED, its own record is more current.
                if test.status.current().state != RunState::Scheduled {
                    test.status.current().clone()
                } else {
                    StatusInfo::new(RunState::SchedStartup, "job is starting up")
                }
            }
            Some(BackendJobStatus::Failed(reason)) => StatusInfo::new(
                RunState::SchedError,
                format!("job failed: {reason}"),
            ),
            Some(BackendJobStatus::Cancelled(reason)) => StatusInfo::new(
                RunState::SchedCancelled,
                format!("job was cancelled: {reason}"),
            ),
            None => {
                if test.status.current().state == RunState::Scheduled {
                    StatusInfo::new(
                        RunState::SchedError,
                        format!("job {} disappeared from the scheduler", info.id),
                    )
                } else {
                    test.status.current().clone()
                }
            }
        };

        if status.state.is_terminal() && !test.status.has_state(status.state) {
            test.status.set(status.state, status.note.clone());
            test.status.mark_complete();
        }

        self.job_statuses
            .insert(job_id, (Instant::now(), status.clone()));
        status
    }

    /// Best-effort cancellation of the job backing `test`. Returns `None` on
    /// success or a human-readable reason when the backend could not (or
    /// would not) kill the job.
    pub fn cancel(&mut self, test: &mut TestRun) -> Option<String> {
        let info = test
            .job
            .and_then(|job_id| self.jobs.get(&job_id))
            .and_then(|job| job.info.clone());

        let Some(info) = info else {
            // Never dispatched; nothing to ask the scheduler for.
            if !test.status.has_state(RunState::SchedCancelled) {
                test.status
                    .set(RunState::SchedCancelled, "job was never started");
            }
            test.status.mark_complete();
            return None;
        };

        match self.backend.cancel(&info) {
            None => {
                if !test.status.has_state(RunState::SchedCancelled) {
                    test.status.set(
                        RunState::SchedCancelled,
                        format!("job {} cancelled by request", info.id),
                    );
                }
                test.status.mark_complete();
                None
            }
            Some(reason) => {
                log::debug!("Cancel of job {} refused: {reason}", info.id);
                Some(reason)
            }
        }
    }

    /// Drop all cached job statuses, forcing the next poll through to the
    /// backend.
    pub fn clear_status_cache(&mut self) {
        self.job_statuses.clear();
    }
}
