use crate::PassError;
use msgtrack_core::{
    normalize, Clock, EventSource, MessageStatusRecord, ReconcileError, ReconcileOutcome,
    SourceFilter, StatusEvent, StatusStore, UpsertCoordinator,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub since: Option<i64>,
    pub max_executions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackReport {
    pub message_id: String,
    pub conversation_id: String,
    pub executions_scanned: usize,
    pub matching_executions: usize,
    pub events_found: usize,
    /// Events for this message addressed to a different conversation.
    pub recipient_mismatches: usize,
    pub malformed_events: usize,
    pub terminal_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<MessageStatusRecord>,
}

/// Looks up a single message in the most recent executions and reconciles it.
///
/// Executions are scanned newest first and the scan stops after the first
/// execution that carries a terminal status for the message. Events whose
/// recipient differs from the requested conversation are reported but never
/// written.
pub fn track_message<Src, S>(
    source: &Src,
    store: &S,
    clock: &dyn Clock,
    workflow_id: &str,
    request: &TrackRequest,
) -> Result<TrackReport, PassError>
where
    Src: EventSource + ?Sized,
    S: StatusStore + ?Sized,
{
    let filter = SourceFilter {
        conversation_id: None,
        since: request.since,
        max_executions: request.max_executions,
    };
    let batches = source.fetch(&filter)?;

    let mut report = TrackReport {
        message_id: request.message_id.clone(),
        conversation_id: request.conversation_id.clone(),
        executions_scanned: 0,
        matching_executions: 0,
        events_found: 0,
        recipient_mismatches: 0,
        malformed_events: 0,
        terminal_reached: false,
        outcome: None,
        record: None,
    };
    let mut per_execution: Vec<Vec<StatusEvent>> = Vec::new();

    for batch in &batches {
        report.executions_scanned += 1;
        let mut found_here = 0;
        let mut matched = Vec::new();

        for raw in &batch.statuses {
            if raw.id.as_deref().map(str::trim) != Some(request.message_id.as_str()) {
                continue;
            }
            let event = match normalize(raw, &batch.execution_id) {
                Ok(event) => event,
                Err(err) => {
                    report.malformed_events += 1;
                    warn!(
                        event = "malformed_status_event",
                        execution_id = %batch.execution_id,
                        error = %err
                    );
                    continue;
                }
            };
            if !filter.admits(&event) {
                continue;
            }

            found_here += 1;
            report.events_found += 1;
            if event.conversation_id != request.conversation_id {
                report.recipient_mismatches += 1;
                continue;
            }
            report.terminal_reached |= event.status.is_terminal();
            matched.push(event);
        }

        if found_here > 0 {
            report.matching_executions += 1;
        }
        per_execution.push(matched);
        if report.terminal_reached {
            info!(
                event = "terminal_status_found",
                message_id = %request.message_id,
                execution_id = %batch.execution_id
            );
            break;
        }
    }

    // newest-first scan; replay executions in the order the provider emitted them
    let matched: Vec<StatusEvent> = per_execution.into_iter().rev().flatten().collect();

    let coordinator = UpsertCoordinator::new(store, clock, workflow_id);
    match coordinator.reconcile_message(&request.message_id, &matched)? {
        Some(reconciliation) => {
            report.outcome = Some(reconciliation.outcome);
            report.record = Some(reconciliation.record);
        }
        None => {
            report.record = store
                .find(&request.message_id)
                .map_err(ReconcileError::from)?;
        }
    }

    info!(
        event = "message_tracked",
        message_id = %report.message_id,
        executions = report.executions_scanned,
        events = report.events_found,
        mismatches = report.recipient_mismatches,
        terminal = report.terminal_reached,
        outcome = report.outcome.map(|outcome| outcome.as_str()).unwrap_or("none")
    );
    Ok(report)
}
