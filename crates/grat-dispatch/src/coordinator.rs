use crate::dispatcher::TaskDispatcher;
use grat_core::{BulkResult, EmptyTargetSetError, TaskOutcome, TaskTemplate};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fans one task template out over a set of targets and reports a single aggregate.
#[derive(Clone)]
pub struct BulkCoordinator {
    dispatcher: TaskDispatcher,
}

#[derive(Debug)]
struct ItemOutcome {
    target_id: String,
    outcome: TaskOutcome,
}

impl BulkCoordinator {
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Target ids are trimmed and duplicates collapse into one item. `on_done`
    /// runs once, after every item reached a terminal outcome.
    pub fn dispatch_all<I, S, F>(
        &self,
        targets: I,
        template: &TaskTemplate,
        on_done: F,
    ) -> Result<BulkHandle, EmptyTargetSetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(BulkResult) + Send + 'static,
    {
        let targets: BTreeSet<String> = targets
            .into_iter()
            .map(|target| Into::<String>::into(target).trim().to_string())
            .collect();
        if targets.is_empty() {
            warn!(event = "bulk_rejected", kind = %template.kind(), reason = "empty_target_set");
            return Err(EmptyTargetSetError);
        }

        let operation_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let total = targets.len();
        let (tx, rx) = mpsc::unbounded_channel::<ItemOutcome>();
        info!(
            event = "bulk_start",
            operation_id = %operation_id,
            kind = %template.kind(),
            total = total
        );

        for target_id in &targets {
            let submission = template.for_target(target_id.clone());
            let dispatcher = self.dispatcher.clone();
            let token = cancel.child_token();
            let tx = tx.clone();
            tokio::spawn(async move {
                let target_id = submission.target_id().to_string();
                match dispatcher.submit(&submission).await {
                    Ok(handle) => {
                        dispatcher.resolve_with_token(handle, token, move |outcome| {
                            let _ = tx.send(ItemOutcome { target_id, outcome });
                        });
                    }
                    Err(err) => {
                        let _ = tx.send(ItemOutcome {
                            target_id,
                            outcome: TaskOutcome::Failed {
                                error: err.to_string(),
                            },
                        });
                    }
                }
            });
        }
        drop(tx);

        let aggregator = BulkAggregator::new(targets);
        let join = tokio::spawn(collect(operation_id, aggregator, rx, on_done));
        Ok(BulkHandle {
            operation_id,
            total,
            cancel,
            join,
        })
    }
}

async fn collect<F>(
    operation_id: Uuid,
    mut aggregator: BulkAggregator,
    mut rx: mpsc::UnboundedReceiver<ItemOutcome>,
    on_done: F,
) where
    F: FnOnce(BulkResult) + Send + 'static,
{
    let result = loop {
        match rx.recv().await {
            Some(item) => {
                debug!(
                    event = "bulk_item_done",
                    operation_id = %operation_id,
                    target_id = %item.target_id,
                    status = item.outcome.as_str()
                );
                if let Some(result) = aggregator.record(&item.target_id, &item.outcome) {
                    break result;
                }
            }
            None => {
                warn!(
                    event = "bulk_incomplete",
                    operation_id = %operation_id,
                    missing = aggregator.remaining()
                );
                match aggregator.abandon_remaining() {
                    Some(result) => break result,
                    None => return,
                }
            }
        }
    };
    info!(
        event = "bulk_done",
        operation_id = %operation_id,
        total = result.total,
        succeeded = result.succeeded,
        failed = result.failed
    );
    on_done(result);
}

/// Completion tally for one bulk operation.
#[derive(Debug)]
pub struct BulkAggregator {
    pending: BTreeSet<String>,
    total: usize,
    succeeded: usize,
    failed: usize,
    finalized: bool,
}

impl BulkAggregator {
    pub fn new(targets: BTreeSet<String>) -> Self {
        Self {
            total: targets.len(),
            pending: targets,
            succeeded: 0,
            failed: 0,
            finalized: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Returns the aggregate exactly once, when the last target reports.
    /// Repeated, unknown or non-terminal reports are ignored.
    pub fn record(&mut self, target_id: &str, outcome: &TaskOutcome) -> Option<BulkResult> {
        if self.finalized || !outcome.is_terminal() {
            return None;
        }
        if !self.pending.remove(target_id) {
            warn!(event = "bulk_duplicate_outcome", target_id = target_id);
            return None;
        }
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if self.pending.is_empty() {
            return self.finalize();
        }
        None
    }

    /// Counts every target still outstanding as failed and finalizes.
    pub fn abandon_remaining(&mut self) -> Option<BulkResult> {
        if self.finalized {
            return None;
        }
        self.failed += self.pending.len();
        self.pending.clear();
        self.finalize()
    }

    fn finalize(&mut self) -> Option<BulkResult> {
        self.finalized = true;
        Some(BulkResult {
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
        })
    }
}

#[derive(Debug)]
pub struct BulkHandle {
    operation_id: Uuid,
    total: usize,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl BulkHandle {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Cancels every item still polling; they count as failed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) {
        if let Err(err) = self.join.await {
            warn!(event = "bulk_join_failed", operation_id = %self.operation_id, error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::PollPolicy;
    use crate::test_support::{ScriptedStep, ScriptedTransport};
    use grat_core::task_api::TransportError;
    use grat_core::TaskKind;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn coordinator(transport: &Arc<ScriptedTransport>, policy: PollPolicy) -> BulkCoordinator {
        BulkCoordinator::new(TaskDispatcher::new(transport.clone(), policy))
    }

    struct DoneRecorder {
        calls: AtomicUsize,
        results: Mutex<Vec<BulkResult>>,
    }

    impl DoneRecorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                results: Mutex::new(Vec::new()),
            })
        }

        fn callback(self: &Arc<Self>) -> impl FnOnce(BulkResult) + Send + 'static {
            let recorder = self.clone();
            move |result| {
                recorder.calls.fetch_add(1, Ordering::SeqCst);
                recorder.results.lock().expect("results").push(result);
            }
        }

        fn single(&self) -> BulkResult {
            assert_eq!(self.calls.load(Ordering::SeqCst), 1, "on_done must fire once");
            self.results.lock().expect("results")[0]
        }
    }

    fn targets(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submissions_count_against_aggregate() {
        let transport = Arc::new(ScriptedTransport::new());
        for id in ["a1", "a2", "a3"] {
            transport.script(id, vec![ScriptedStep::completed("bye")]);
        }
        transport.reject_target(
            "gone",
            TransportError::Unreachable("connection reset".to_string()),
        );
        let recorder = DoneRecorder::new();

        let handle = coordinator(&transport, PollPolicy::default())
            .dispatch_all(
                ["a1", "a2", "a3", "gone"],
                &TaskTemplate::terminate(),
                recorder.callback(),
            )
            .expect("dispatch");
        assert_eq!(handle.total(), 4);
        handle.wait().await;

        assert_eq!(
            recorder.single(),
            BulkResult {
                total: 4,
                succeeded: 3,
                failed: 1
            }
        );
        let created = transport.created();
        assert_eq!(created.len(), 3);
        assert!(created
            .iter()
            .all(|(_, request)| request.kind == TaskKind::Terminate && request.command == "exit"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_target_set_is_rejected_synchronously() {
        let transport = Arc::new(ScriptedTransport::new());
        let recorder = DoneRecorder::new();

        let result = coordinator(&transport, PollPolicy::default()).dispatch_all(
            Vec::<String>::new(),
            &TaskTemplate::terminate(),
            recorder.callback(),
        );
        assert_eq!(result.err(), Some(EmptyTargetSetError));

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert!(transport.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_outcomes_including_timeouts_and_failures() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "slow",
            vec![
                ScriptedStep::pending(),
                ScriptedStep::pending(),
                ScriptedStep::pending(),
                ScriptedStep::completed("ok"),
            ],
        );
        transport.script("fast", vec![ScriptedStep::completed("ok")]);
        transport.script(
            "broken",
            vec![ScriptedStep::pending(), ScriptedStep::failed("segfault")],
        );
        transport.script(
            "flaky",
            vec![ScriptedStep::Fail(TransportError::Decode("eof".to_string()))],
        );
        let policy = PollPolicy {
            max_attempts: 5,
            ..PollPolicy::default()
        };
        let recorder = DoneRecorder::new();
        let mut payload = BTreeMap::new();
        payload.insert("command".to_string(), "uname -a".to_string());

        coordinator(&transport, policy)
            .dispatch_all(
                ["slow", "fast", "broken", "flaky", "stuck"],
                &TaskTemplate::new(TaskKind::Shell, payload),
                recorder.callback(),
            )
            .expect("dispatch")
            .wait()
            .await;

        assert_eq!(
            recorder.single(),
            BulkResult {
                total: 5,
                succeeded: 2,
                failed: 3
            }
        );
        let stuck = transport
            .created()
            .iter()
            .position(|(target, _)| target == "stuck")
            .expect("stuck submitted");
        let stuck_task = format!("task-{}-stuck", stuck + 1);
        assert_eq!(transport.poll_count(&stuck_task), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_targets_collapse() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a1", vec![ScriptedStep::completed("")]);
        transport.script("a2", vec![ScriptedStep::completed("")]);
        let recorder = DoneRecorder::new();

        coordinator(&transport, PollPolicy::default())
            .dispatch_all(
                vec!["a1".to_string(), "a2".to_string(), " a1 ".to_string()],
                &TaskTemplate::terminate(),
                recorder.callback(),
            )
            .expect("dispatch")
            .wait()
            .await;

        assert_eq!(
            recorder.single(),
            BulkResult {
                total: 2,
                succeeded: 2,
                failed: 0
            }
        );
        assert_eq!(transport.created().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_target_inside_set_counts_as_failed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a1", vec![ScriptedStep::completed("")]);
        let recorder = DoneRecorder::new();

        coordinator(&transport, PollPolicy::default())
            .dispatch_all(["a1", ""], &TaskTemplate::terminate(), recorder.callback())
            .expect("dispatch")
            .wait()
            .await;

        assert_eq!(
            recorder.single(),
            BulkResult {
                total: 2,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_bulk_operation_fails_outstanding_items() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("quick", vec![ScriptedStep::completed("")]);
        let recorder = DoneRecorder::new();

        let handle = coordinator(&transport, PollPolicy::default())
            .dispatch_all(
                ["quick", "hang-1", "hang-2"],
                &TaskTemplate::terminate(),
                recorder.callback(),
            )
            .expect("dispatch");
        tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
        assert!(!handle.is_finished());
        handle.cancel();
        handle.wait().await;

        assert_eq!(
            recorder.single(),
            BulkResult {
                total: 3,
                succeeded: 1,
                failed: 2
            }
        );
    }

    #[test]
    fn aggregator_ignores_duplicate_and_unknown_reports() {
        let mut aggregator = BulkAggregator::new(targets(&["a", "b"]));
        let done = TaskOutcome::Completed {
            output: String::new(),
        };

        assert_eq!(aggregator.record("a", &done), None);
        assert_eq!(aggregator.record("a", &TaskOutcome::TimedOut), None);
        assert_eq!(aggregator.record("zzz", &done), None);
        assert_eq!(aggregator.record("b", &TaskOutcome::Pending), None);
        assert_eq!(aggregator.remaining(), 1);

        let result = aggregator
            .record("b", &TaskOutcome::TimedOut)
            .expect("finalized");
        assert_eq!(
            result,
            BulkResult {
                total: 2,
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(aggregator.record("b", &done), None);
        assert_eq!(aggregator.abandon_remaining(), None);
    }

    #[test]
    fn aggregator_is_order_independent() {
        let outcomes = [
            (
                "a",
                TaskOutcome::Completed {
                    output: "x".to_string(),
                },
            ),
            (
                "b",
                TaskOutcome::Failed {
                    error: "y".to_string(),
                },
            ),
            ("c", TaskOutcome::Cancelled),
        ];
        let mut forward = BulkAggregator::new(targets(&["a", "b", "c"]));
        let mut backward = BulkAggregator::new(targets(&["a", "b", "c"]));

        let mut forward_result = None;
        for (id, outcome) in outcomes.iter() {
            forward_result = forward_result.or(forward.record(id, outcome));
        }
        let mut backward_result = None;
        for (id, outcome) in outcomes.iter().rev() {
            backward_result = backward_result.or(backward.record(id, outcome));
        }

        assert_eq!(forward_result, backward_result);
        let result = forward_result.expect("finalized");
        assert_eq!(result.succeeded + result.failed, result.total);
    }

    #[test]
    fn abandon_counts_missing_targets_as_failed() {
        let mut aggregator = BulkAggregator::new(targets(&["a", "b", "c"]));
        aggregator.record(
            "a",
            &TaskOutcome::Completed {
                output: String::new(),
            },
        );

        assert_eq!(
            aggregator.abandon_remaining(),
            Some(BulkResult {
                total: 3,
                succeeded: 1,
                failed: 2
            })
        );
    }
}
