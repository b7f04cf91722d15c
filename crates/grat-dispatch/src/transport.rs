use async_trait::async_trait;
use grat_core::task_api::{
    AgentSummary, CreateTaskRequest, CreateTaskResponse, ServerStatus, TaskResultPayload,
    TaskSummary, TransportError, AGENTS_PATH, RESULTS_PATH, SERVER_STATUS_PATH, TASKS_PATH,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The two calls the dispatch core needs from the task service.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn create_task(
        &self,
        target_id: &str,
        request: &CreateTaskRequest,
    ) -> Result<CreateTaskResponse, TransportError>;

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResultPayload, TransportError>;
}

#[derive(Clone, Debug)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TransportError::Unreachable(format!(
                "invalid server url: {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>, TransportError> {
        self.get_json(AGENTS_PATH, &[]).await
    }

    /// Queued tasks, optionally limited to one agent. The server answers
    /// `null` for an agent without a queue.
    pub async fn list_tasks(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<TaskSummary>, TransportError> {
        let query: Vec<(&str, &str)> = agent_id.map(|id| ("agent_id", id)).into_iter().collect();
        let tasks: Option<Vec<TaskSummary>> = self.get_json(TASKS_PATH, &query).await?;
        Ok(tasks.unwrap_or_default())
    }

    pub async fn server_status(&self) -> Result<ServerStatus, TransportError> {
        self.get_json(SERVER_STATUS_PATH, &[]).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        let url = self.endpoint(path);
        debug!(event = "http_request", method = "GET", url = %url, query = ?query);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        read_json(response).await
    }
}

#[async_trait]
impl TaskTransport for HttpTransport {
    async fn create_task(
        &self,
        target_id: &str,
        request: &CreateTaskRequest,
    ) -> Result<CreateTaskResponse, TransportError> {
        let url = self.endpoint(TASKS_PATH);
        debug!(event = "http_request", method = "POST", url = %url, target_id = target_id);
        let response = self
            .client
            .post(&url)
            .query(&[("agent_id", target_id)])
            .json(request)
            .send()
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        read_json(response).await
    }

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResultPayload, TransportError> {
        self.get_json(RESULTS_PATH, &[("task_id", task_id)]).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = match body.trim() {
            "" => status.canonical_reason().unwrap_or("request rejected").to_string(),
            text => text.to_string(),
        };
        return Err(TransportError::Status {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|err| TransportError::Decode(err.to_string()))
}
