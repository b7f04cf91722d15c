use crate::transport::TaskTransport;
use grat_core::task_api::CreateTaskRequest;
use grat_core::{SubmissionError, TaskHandle, TaskOutcome, TaskSubmission, RESULT_CHECK_FAILED};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub settle_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    /// A zero budget still allows one poll.
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Submits tasks and resolves their handles to a terminal outcome.
#[derive(Clone)]
pub struct TaskDispatcher {
    transport: Arc<dyn TaskTransport>,
    policy: PollPolicy,
}

impl TaskDispatcher {
    pub fn new(transport: Arc<dyn TaskTransport>, policy: PollPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub async fn submit(&self, submission: &TaskSubmission) -> Result<TaskHandle, SubmissionError> {
        if let Err(err) = submission.validate() {
            warn!(event = "task_submit_rejected", kind = %submission.kind(), error = %err);
            return Err(err);
        }
        let request = CreateTaskRequest::from(submission);
        let response = match self
            .transport
            .create_task(submission.target_id(), &request)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    event = "task_submit_failed",
                    target_id = submission.target_id(),
                    kind = %submission.kind(),
                    error = %err
                );
                return Err(err.into());
            }
        };
        let task_id = response
            .task_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                warn!(
                    event = "task_submit_failed",
                    target_id = submission.target_id(),
                    error = "missing_task_id"
                );
                SubmissionError::MissingTaskId
            })?;
        let handle = TaskHandle::new(task_id);
        info!(
            event = "task_submitted",
            target_id = submission.target_id(),
            kind = %submission.kind(),
            task_id = %handle.task_id
        );
        Ok(handle)
    }

    /// Starts polling `handle` in the background. `on_outcome` runs once with
    /// the first terminal outcome.
    pub fn resolve<F>(&self, handle: TaskHandle, on_outcome: F) -> ResolveHandle
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        self.resolve_with_token(handle, CancellationToken::new(), on_outcome)
    }

    pub(crate) fn resolve_with_token<F>(
        &self,
        handle: TaskHandle,
        cancel: CancellationToken,
        on_outcome: F,
    ) -> ResolveHandle
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        let transport = self.transport.clone();
        let policy = self.policy;
        let task_id = handle.task_id.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = poll_until_terminal(transport.as_ref(), &handle, &policy, &token).await;
            on_outcome(outcome);
        });
        ResolveHandle {
            task_id,
            cancel,
            join,
        }
    }

    /// Submit then resolve. Submission failures are returned directly and never
    /// reach `on_outcome`.
    pub async fn track<F>(
        &self,
        submission: &TaskSubmission,
        on_outcome: F,
    ) -> Result<ResolveHandle, SubmissionError>
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        let handle = self.submit(submission).await?;
        Ok(self.resolve(handle, on_outcome))
    }

    pub async fn execute(&self, submission: &TaskSubmission) -> Result<TaskOutcome, SubmissionError> {
        let (tx, rx) = oneshot::channel();
        let _tracking = self
            .track(submission, move |outcome| {
                let _ = tx.send(outcome);
            })
            .await?;
        Ok(rx.await.unwrap_or_else(|_| TaskOutcome::Failed {
            error: RESULT_CHECK_FAILED.to_string(),
        }))
    }
}

/// Handle to one background polling sequence.
#[derive(Debug)]
pub struct ResolveHandle {
    task_id: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ResolveHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Stops polling before the next attempt; the callback then receives `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits until the callback has run.
    pub async fn wait(self) {
        if let Err(err) = self.join.await {
            warn!(event = "resolve_join_failed", task_id = %self.task_id, error = %err);
        }
    }
}

async fn poll_until_terminal(
    transport: &dyn TaskTransport,
    handle: &TaskHandle,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let budget = policy.attempt_budget();
    if !pause(policy.settle_delay, cancel).await {
        return cancelled(handle, 0);
    }

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return cancelled(handle, attempt);
        }
        attempt += 1;
        let outcome = match transport.get_task_result(&handle.task_id).await {
            Ok(payload) => payload.outcome(),
            Err(err) => {
                warn!(
                    event = "result_check_failed",
                    task_id = %handle.task_id,
                    attempt = attempt,
                    error = %err
                );
                return TaskOutcome::Failed {
                    error: RESULT_CHECK_FAILED.to_string(),
                };
            }
        };
        debug!(
            event = "task_poll",
            task_id = %handle.task_id,
            attempt = attempt,
            status = outcome.as_str()
        );

        if outcome.is_terminal() {
            info!(
                event = "task_resolved",
                task_id = %handle.task_id,
                attempts = attempt,
                status = outcome.as_str()
            );
            return outcome;
        }
        if attempt >= budget {
            warn!(event = "task_timed_out", task_id = %handle.task_id, attempts = attempt);
            return TaskOutcome::TimedOut;
        }
        if !pause(policy.interval, cancel).await {
            return cancelled(handle, attempt);
        }
    }
}

/// Returns false when cancelled during the wait.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn cancelled(handle: &TaskHandle, attempts: u32) -> TaskOutcome {
    info!(event = "task_cancelled", task_id = %handle.task_id, attempts = attempts);
    TaskOutcome::Cancelled
}
