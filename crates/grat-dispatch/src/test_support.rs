use crate::transport::TaskTransport;
use async_trait::async_trait;
use grat_core::task_api::{CreateTaskRequest, CreateTaskResponse, TaskResultPayload, TransportError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub(crate) enum ScriptedStep {
    Respond(TaskResultPayload),
    Fail(TransportError),
}

impl ScriptedStep {
    pub(crate) fn status(status: &str) -> Self {
        ScriptedStep::Respond(TaskResultPayload {
            status: status.to_string(),
            ..Default::default()
        })
    }

    pub(crate) fn pending() -> Self {
        Self::status("pending")
    }

    pub(crate) fn completed(output: &str) -> Self {
        ScriptedStep::Respond(TaskResultPayload {
            status: "completed".to_string(),
            output: Some(output.to_string()),
            ..Default::default()
        })
    }

    pub(crate) fn failed(error: &str) -> Self {
        ScriptedStep::Respond(TaskResultPayload {
            status: "failed".to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct ScriptState {
    next_id: u64,
    by_target: HashMap<String, Vec<ScriptedStep>>,
    rejected: HashMap<String, TransportError>,
    without_id: HashSet<String>,
    queues: HashMap<String, VecDeque<ScriptedStep>>,
    created: Vec<(String, CreateTaskRequest)>,
    polls: HashMap<String, Vec<Instant>>,
}

/// In-memory task service. Unscripted tasks stay pending forever.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("scripted transport state")
    }

    pub(crate) fn script(&self, target_id: &str, steps: Vec<ScriptedStep>) {
        self.lock().by_target.insert(target_id.to_string(), steps);
    }

    pub(crate) fn reject_target(&self, target_id: &str, err: TransportError) {
        self.lock().rejected.insert(target_id.to_string(), err);
    }

    pub(crate) fn omit_task_id(&self, target_id: &str) {
        self.lock().without_id.insert(target_id.to_string());
    }

    pub(crate) fn created(&self) -> Vec<(String, CreateTaskRequest)> {
        self.lock().created.clone()
    }

    pub(crate) fn poll_times(&self, task_id: &str) -> Vec<Instant> {
        self.lock().polls.get(task_id).cloned().unwrap_or_default()
    }

    pub(crate) fn poll_count(&self, task_id: &str) -> usize {
        self.poll_times(task_id).len()
    }

    pub(crate) fn total_polls(&self) -> usize {
        self.lock().polls.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl TaskTransport for ScriptedTransport {
    async fn create_task(
        &self,
        target_id: &str,
        request: &CreateTaskRequest,
    ) -> Result<CreateTaskResponse, TransportError> {
        let mut state = self.lock();
        if let Some(err) = state.rejected.get(target_id) {
            return Err(err.clone());
        }
        state
            .created
            .push((target_id.to_string(), request.clone()));
        if state.without_id.contains(target_id) {
            return Ok(CreateTaskResponse { task_id: None });
        }
        state.next_id += 1;
        let task_id = format!("task-{}-{target_id}", state.next_id);
        let steps = state.by_target.remove(target_id).unwrap_or_default();
        state.queues.insert(task_id.clone(), steps.into());
        Ok(CreateTaskResponse {
            task_id: Some(task_id),
        })
    }

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResultPayload, TransportError> {
        let mut state = self.lock();
        state
            .polls
            .entry(task_id.to_string())
            .or_default()
            .push(Instant::now());
        let step = state
            .queues
            .get_mut(task_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(ScriptedStep::pending);
        match step {
            ScriptedStep::Respond(payload) => Ok(payload),
            ScriptedStep::Fail(err) => Err(err),
        }
    }
}
