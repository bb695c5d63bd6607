use crate::{failure, failure::Failure};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

// The lifecycle of a task. Transitions are monotone along one of the two
// paths `not_started → (waiting_for_task)? → (waiting_for_semaphore)? →
// running → {success|failed}` or `… → skipped`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Running,
    WaitingForTask,
    WaitingForSemaphore,
    Success,
    Failed,
    Skipped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::WaitingForTask => "waiting_for_task",
            Status::WaitingForSemaphore => "waiting_for_semaphore",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Seconds since the epoch, as the snapshots store timestamps.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// The status of a whole run, derived from its task statuses.
pub fn overall_status(statuses: &[Status]) -> Status {
    if statuses.is_empty() {
        return Status::NotStarted;
    }
    if statuses.iter().all(|status| *status == Status::Skipped) {
        return Status::Skipped;
    }
    if statuses
        .iter()
        .all(|status| matches!(status, Status::Success | Status::Skipped))
    {
        return Status::Success;
    }
    if statuses.contains(&Status::Running) {
        return Status::Running;
    }
    if statuses.contains(&Status::WaitingForSemaphore) {
        return Status::WaitingForSemaphore;
    }
    if statuses.contains(&Status::WaitingForTask) {
        // Should only happen momentarily in race conditions
        return Status::WaitingForTask;
    }
    Status::Failed
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSnapshot {
    pub name: String,
    pub status: Status,
    pub run_after: Vec<String>,
    pub run_always: bool,
    pub acquire_semaphore: Vec<String>,
    pub acquired_semaphore: String,
    pub started: Option<f64>,
    pub finished: Option<f64>,
}

// The run-level snapshot serialized to `state.json` on every state change.
// Unknown fields and type mismatches fail the load, so a snapshot that
// parses is known to be well-formed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StateSnapshot {
    pub commit: String,
    pub branch: String,
    pub repo_name: String,
    pub log_url: String,
    pub identifier: String,
    pub status: Status,
    pub started: f64,
    pub finished: Option<f64>,
    pub tasks: Vec<TaskSnapshot>,
}

impl StateSnapshot {
    pub fn save(&self, path: &Path) -> Result<(), Failure> {
        let data = serde_json::to_string_pretty(self)
            .map_err(failure::system("Unable to serialize state."))?;
        fs::write(path, data).map_err(failure::system(format!(
            "Unable to write state file {}.",
            path.to_string_lossy(),
        )))
    }

    pub fn load(path: &Path) -> Result<StateSnapshot, Failure> {
        let data = fs::read_to_string(path).map_err(failure::system(format!(
            "Unable to read state file {}.",
            path.to_string_lossy(),
        )))?;
        serde_json::from_str(&data).map_err(failure::user(format!(
            "Unable to parse state file {}.",
            path.to_string_lossy(),
        )))
    }
}
