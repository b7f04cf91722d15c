use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod task_api;

use task_api::TransportError;

/// Error text reported when the result endpoint cannot be reached mid-poll.
pub const RESULT_CHECK_FAILED: &str = "result check failed";
/// Error text used when the remote marks a task failed without saying why.
pub const DEFAULT_FAILURE_MESSAGE: &str = "command execution failed";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Shell,
    Terminate,
    Screenshot,
    PortScan,
    ProcessControl,
    Noop,
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Shell => "shell",
            TaskKind::Terminate => "terminate",
            TaskKind::Screenshot => "screenshot",
            TaskKind::PortScan => "port_scan",
            TaskKind::ProcessControl => "process_control",
            TaskKind::Noop => "noop",
            TaskKind::Other(tag) => tag,
        }
    }

    /// Command sent when the payload carries none.
    pub fn default_command(&self) -> &'static str {
        match self {
            TaskKind::Terminate => "exit",
            _ => "",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    /// Known kinds match case-insensitively; unknown tags keep their spelling.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err("task kind must not be empty".to_string()),
            "shell" => Ok(TaskKind::Shell),
            "terminate" | "kill" => Ok(TaskKind::Terminate),
            "screenshot" => Ok(TaskKind::Screenshot),
            "port_scan" | "port-scan" | "portscan" => Ok(TaskKind::PortScan),
            "process_control" | "process-control" => Ok(TaskKind::ProcessControl),
            "noop" => Ok(TaskKind::Noop),
            _ => Ok(TaskKind::Other(trimmed.to_string())),
        }
    }
}

impl Serialize for TaskKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One unit of work addressed to a single agent. The target id is stored trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSubmission {
    target_id: String,
    kind: TaskKind,
    payload: BTreeMap<String, String>,
}

impl TaskSubmission {
    pub fn new(
        target_id: impl Into<String>,
        kind: TaskKind,
        payload: BTreeMap<String, String>,
    ) -> Self {
        let target_id: String = target_id.into();
        Self {
            target_id: target_id.trim().to_string(),
            kind,
            payload,
        }
    }

    pub fn shell(target_id: impl Into<String>, command: impl Into<String>) -> Self {
        let mut payload = BTreeMap::new();
        payload.insert("command".to_string(), command.into());
        Self::new(target_id, TaskKind::Shell, payload)
    }

    pub fn terminate(target_id: impl Into<String>) -> Self {
        Self::new(target_id, TaskKind::Terminate, BTreeMap::new())
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.payload
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.target_id.is_empty() {
            return Err(SubmissionError::EmptyTargetId);
        }
        Ok(())
    }
}

/// Kind and payload shared by every item of a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTemplate {
    kind: TaskKind,
    payload: BTreeMap<String, String>,
}

impl TaskTemplate {
    pub fn new(kind: TaskKind, payload: BTreeMap<String, String>) -> Self {
        Self { kind, payload }
    }

    pub fn terminate() -> Self {
        Self::new(TaskKind::Terminate, BTreeMap::new())
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn for_target(&self, target_id: impl Into<String>) -> TaskSubmission {
        TaskSubmission::new(target_id, self.kind.clone(), self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl TaskHandle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Pending,
    Completed { output: String },
    Failed { error: String },
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Pending => "pending",
            TaskOutcome::Completed { .. } => "completed",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::TimedOut => "timed_out",
            TaskOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed { output } => write!(f, "completed: {output}"),
            TaskOutcome::Failed { error } => write!(f, "failed: {error}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Aggregate of a finished bulk operation. Timeouts and cancellations count as failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("target id must not be empty")]
    EmptyTargetId,
    #[error("task submission failed: {0}")]
    Transport(#[from] TransportError),
    #[error("server accepted the task without returning a task id")]
    MissingTaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bulk dispatch requires at least one target")]
pub struct EmptyTargetSetError;
