use crate::{TaskKind, TaskOutcome, TaskSubmission, DEFAULT_FAILURE_MESSAGE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const TASKS_PATH: &str = "/api/tasks";
pub const RESULTS_PATH: &str = "/api/results";
pub const AGENTS_PATH: &str = "/api/agents";
pub const SERVER_STATUS_PATH: &str = "/api/server/status";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Unreachable(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("response decode failed: {0}")]
    Decode(String),
}

/// Body of `POST /api/tasks?agent_id=<target>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

impl From<&TaskSubmission> for CreateTaskRequest {
    fn from(submission: &TaskSubmission) -> Self {
        let mut args = submission.payload().clone();
        let command = args
            .remove("command")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| submission.kind().default_command().to_string());
        Self {
            kind: submission.kind().clone(),
            command,
            args,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTaskResponse {
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Body of `GET /api/results?task_id=<id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResultPayload {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

impl TaskResultPayload {
    /// Anything other than an explicit `completed` or `failed` status is still pending.
    pub fn outcome(&self) -> TaskOutcome {
        match self.status.trim().to_lowercase().as_str() {
            "completed" => TaskOutcome::Completed {
                output: self.output.clone().unwrap_or_default(),
            },
            "failed" => TaskOutcome::Failed {
                error: self
                    .error
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or(DEFAULT_FAILURE_MESSAGE)
                    .to_string(),
            },
            _ => TaskOutcome::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemInfo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub hostname: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub os: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub architecture: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
}

/// Entry of `GET /api/agents`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSummary {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ip: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub system_info: SystemInfo,
    #[serde(default, deserialize_with = "null_as_default")]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub capabilities: Vec<String>,
}

/// Entry of `GET /api/tasks[?agent_id=<target>]`. Queued tasks carry no
/// status, so a missing one reads as pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSummary {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub command: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

impl TaskSummary {
    pub fn status_label(&self) -> &str {
        match self.status.as_deref().map(str::trim) {
            Some(status) if !status.is_empty() => status,
            _ => "pending",
        }
    }
}

/// Body of `GET /api/server/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStatus {
    #[serde(default, deserialize_with = "null_as_default")]
    pub version: String,
    /// Seconds since the server started.
    #[serde(default, deserialize_with = "null_as_default")]
    pub uptime: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub agents: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub recent_activity: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
