pub mod plan;
pub mod track;

use msgtrack_core::{
    Clock, DeliveryStatus, EventSource, ReconcileError, ReconcileOutcome, SourceError,
    SourceFilter, StatusStore, StoreError, UpsertCoordinator,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

pub use plan::{plan_pass, MessageBatch, PassPlan};
pub use track::{track_message, TrackReport, TrackRequest};

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum PassError {
    #[error("event source failed: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("reconciliation worker {0} panicked")]
    WorkerPanicked(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassConfig {
    pub workflow_id: String,
    pub workers: usize,
    pub filter: SourceFilter,
    /// Keep only the N messages whose newest event is most recent.
    pub max_messages: Option<usize>,
}

impl PassConfig {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workers: DEFAULT_WORKERS,
            filter: SourceFilter::default(),
            max_messages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResult {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_timestamp_formatted: Option<String>,
    pub status_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub workflow_id: String,
    pub executions_scanned: usize,
    pub events_observed: usize,
    pub malformed_events: usize,
    pub filtered_events: usize,
    pub messages_observed: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub store_unavailable: usize,
    pub cancelled: usize,
    pub messages: Vec<MessageResult>,
}

impl PassReport {
    pub fn attempted(&self) -> usize {
        self.new + self.changed + self.unchanged + self.failed
    }

    /// Every attempted message failed because the store could not be reached.
    pub fn is_total_store_failure(&self) -> bool {
        let attempted = self.attempted();
        attempted > 0 && self.store_unavailable == attempted
    }

    fn absorb(&mut self, worker: WorkerReport) {
        self.new += worker.new;
        self.changed += worker.changed;
        self.unchanged += worker.unchanged;
        self.failed += worker.failed;
        self.store_unavailable += worker.store_unavailable;
        self.cancelled += worker.cancelled;
    }
}

#[derive(Debug, Default)]
struct WorkerReport {
    new: usize,
    changed: usize,
    unchanged: usize,
    failed: usize,
    store_unavailable: usize,
    cancelled: usize,
    messages: Vec<(usize, MessageResult)>,
}

/// Index of the worker that owns `message_id` when `workers` share a pass.
pub fn partition_for(message_id: &str, workers: usize) -> usize {
    let workers = workers.max(1);
    let digest = Sha256::digest(message_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % workers as u64) as usize
}

/// Runs one reconciliation pass: fetch, normalize, group, then reconcile every
/// message through its own store connection.
///
/// A source failure aborts before anything is written. Per-message failures
/// are counted and the pass carries on. Setting `cancel` stops workers
/// between messages.
pub fn run_pass<Src, S, Open>(
    source: &Src,
    open_store: Open,
    clock: &dyn Clock,
    config: &PassConfig,
    cancel: &AtomicBool,
) -> Result<PassReport, PassError>
where
    Src: EventSource + ?Sized,
    S: StatusStore,
    Open: Fn() -> Result<S, StoreError> + Sync,
{
    info!(
        event = "pass_started",
        workflow_id = %config.workflow_id,
        max_executions = config.filter.max_executions,
        workers = config.workers
    );

    let batches = source.fetch(&config.filter).map_err(|err| {
        warn!(event = "source_failed", error = %err);
        PassError::Source(err)
    })?;
    let plan = plan_pass(&batches, &config.filter, config.max_messages);

    let mut report = PassReport {
        workflow_id: config.workflow_id.clone(),
        executions_scanned: plan.executions_scanned,
        events_observed: plan.events_observed,
        malformed_events: plan.malformed_events,
        filtered_events: plan.filtered_events,
        messages_observed: plan.messages.len(),
        ..PassReport::default()
    };

    let workers = config.workers.max(1).min(plan.messages.len().max(1));
    let partitions = partition_plan(plan, workers);

    let results: Vec<Result<WorkerReport, PassError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .into_iter()
            .enumerate()
            .map(|(worker, messages)| {
                let open_store = &open_store;
                let workflow_id = config.workflow_id.as_str();
                scope.spawn(move || {
                    run_worker(worker, messages, open_store, clock, workflow_id, cancel)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(PassError::WorkerPanicked(worker)))
            })
            .collect()
    });

    let mut ordered = Vec::new();
    for result in results {
        let mut worker = result?;
        ordered.append(&mut worker.messages);
        report.absorb(worker);
    }
    ordered.sort_by_key(|(position, _)| *position);
    report.messages = ordered.into_iter().map(|(_, result)| result).collect();

    info!(
        event = "pass_finished",
        workflow_id = %report.workflow_id,
        executions = report.executions_scanned,
        messages = report.messages_observed,
        new = report.new,
        changed = report.changed,
        unchanged = report.unchanged,
        failed = report.failed,
        malformed = report.malformed_events,
        cancelled = report.cancelled
    );
    Ok(report)
}

fn partition_plan(plan: PassPlan, workers: usize) -> Vec<Vec<(usize, MessageBatch)>> {
    let mut partitions: Vec<Vec<(usize, MessageBatch)>> = (0..workers).map(|_| Vec::new()).collect();
    for (position, message) in plan.messages.into_iter().enumerate() {
        let worker = partition_for(&message.message_id, workers);
        partitions[worker].push((position, message));
    }
    partitions
}

fn run_worker<S, Open>(
    worker: usize,
    messages: Vec<(usize, MessageBatch)>,
    open_store: &Open,
    clock: &dyn Clock,
    workflow_id: &str,
    cancel: &AtomicBool,
) -> Result<WorkerReport, PassError>
where
    S: StatusStore,
    Open: Fn() -> Result<S, StoreError> + Sync,
{
    let mut report = WorkerReport::default();
    if messages.is_empty() {
        return Ok(report);
    }

    let store = match open_store() {
        Ok(store) => store,
        Err(err) => {
            warn!(event = "store_open_failed", worker, error = %err);
            let unavailable = err.is_unavailable();
            for (position, message) in messages {
                report.failed += 1;
                if unavailable {
                    report.store_unavailable += 1;
                }
                report
                    .messages
                    .push((position, failed_result(&message, err.to_string())));
            }
            return Ok(report);
        }
    };
    let coordinator = UpsertCoordinator::new(&store, clock, workflow_id);

    let total = messages.len();
    for (index, (position, message)) in messages.into_iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            report.cancelled = total - index;
            info!(event = "worker_cancelled", worker, remaining = report.cancelled);
            break;
        }

        match coordinator.reconcile_message(&message.message_id, &message.events) {
            Ok(Some(reconciliation)) => {
                match reconciliation.outcome {
                    ReconcileOutcome::New => report.new += 1,
                    ReconcileOutcome::Changed => report.changed += 1,
                    ReconcileOutcome::Unchanged => report.unchanged += 1,
                }
                let record = &reconciliation.record;
                report.messages.push((
                    position,
                    MessageResult {
                        message_id: record.message_id.clone(),
                        conversation_id: record.conversation_id.clone(),
                        outcome: Some(reconciliation.outcome),
                        latest_status: Some(record.latest_status.clone()),
                        latest_timestamp_formatted: record.latest_timestamp_formatted.clone(),
                        status_count: record.status_count,
                        error: None,
                    },
                ));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    event = "message_failed",
                    worker,
                    message_id = %message.message_id,
                    error = %err
                );
                report.failed += 1;
                if err.is_store_unavailable() {
                    report.store_unavailable += 1;
                }
                report
                    .messages
                    .push((position, failed_result(&message, err.to_string())));
            }
        }
    }

    Ok(report)
}

fn failed_result(message: &MessageBatch, error: String) -> MessageResult {
    MessageResult {
        message_id: message.message_id.clone(),
        conversation_id: message
            .events
            .first()
            .map(|event| event.conversation_id.clone())
            .unwrap_or_default(),
        outcome: None,
        latest_status: None,
        latest_timestamp_formatted: None,
        status_count: 0,
        error: Some(error),
    }
}
