use crate::dedup::merge_history;
use crate::record::MessageStatusRecord;
use crate::status::{DeliveryStatus, StatusEvent};
use chrono::{DateTime, FixedOffset, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const FORMATTED_TIMESTAMP_PATTERN: &str = "%Y-%m-%d %H:%M";

/// Inputs the engine needs besides the events themselves. `now` is already
/// rendered in the configured zone.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub now: DateTime<FixedOffset>,
    pub zone: Tz,
    pub workflow_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    New,
    Changed,
    Unchanged,
}

impl ReconcileOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replacement of history-derived fields on an existing record. Only valid
/// while the stored record still has `expected_status_count` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPatch {
    pub message_id: String,
    pub expected_status_count: usize,
    pub status_history: Vec<StatusEvent>,
    pub status_count: usize,
    pub latest_status: DeliveryStatus,
    pub latest_timestamp: i64,
    pub latest_timestamp_formatted: Option<String>,
    pub workflow_id: String,
    pub last_updated_at: DateTime<FixedOffset>,
    pub last_scanned_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTouch {
    pub message_id: String,
    pub last_scanned_at: DateTime<FixedOffset>,
}

/// The single write a reconciliation pass issues for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert(MessageStatusRecord),
    Patch(StatusPatch),
    Touch(ScanTouch),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    pub mutation: Mutation,
    /// Record as it reads once `mutation` has been applied.
    pub record: MessageStatusRecord,
    pub novel_events: usize,
}

/// Decides what a batch of events means for one message.
///
/// Returns `None` for an empty batch: absence of events is not a scan.
pub fn reconcile(
    existing: Option<&MessageStatusRecord>,
    batch: &[StatusEvent],
    ctx: &ReconcileContext,
) -> Option<Reconciliation> {
    let first = batch.first()?;
    Some(match existing {
        None => reconcile_new(first, batch, ctx),
        Some(existing) => reconcile_existing(existing, batch, ctx),
    })
}

fn reconcile_new(
    first: &StatusEvent,
    batch: &[StatusEvent],
    ctx: &ReconcileContext,
) -> Reconciliation {
    let history = merge_history(&[], batch);
    let (latest_status, latest_timestamp) = match history.last() {
        Some(last) => (last.status.clone(), last.timestamp),
        None => (first.status.clone(), first.timestamp),
    };

    let record = MessageStatusRecord {
        message_id: first.message_id.clone(),
        conversation_id: first.conversation_id.clone(),
        latest_timestamp_formatted: format_in_zone(latest_timestamp, &ctx.zone),
        latest_status,
        latest_timestamp,
        status_count: history.len(),
        status_history: history,
        workflow_id: ctx.workflow_id.clone(),
        first_seen_at: ctx.now,
        last_updated_at: ctx.now,
        last_scanned_at: ctx.now,
    };

    Reconciliation {
        outcome: ReconcileOutcome::New,
        novel_events: record.status_count,
        mutation: Mutation::Insert(record.clone()),
        record,
    }
}

fn reconcile_existing(
    existing: &MessageStatusRecord,
    batch: &[StatusEvent],
    ctx: &ReconcileContext,
) -> Reconciliation {
    let merged = merge_history(&existing.status_history, batch);
    let novel_events = merged.len().saturating_sub(existing.status_history.len());
    let last_scanned_at = ctx.now.max(existing.last_scanned_at);

    let latest = merged
        .last()
        .map(|last| (last.status.clone(), last.timestamp));
    let latest_changed = latest.as_ref().is_some_and(|(status, timestamp)| {
        *status != existing.latest_status || *timestamp != existing.latest_timestamp
    });

    if !latest_changed && novel_events == 0 {
        let mut record = existing.clone();
        record.last_scanned_at = last_scanned_at;
        return Reconciliation {
            outcome: ReconcileOutcome::Unchanged,
            mutation: Mutation::Touch(ScanTouch {
                message_id: existing.message_id.clone(),
                last_scanned_at,
            }),
            record,
            novel_events,
        };
    }

    let (latest_status, latest_timestamp) = latest.unwrap_or_else(|| {
        (existing.latest_status.clone(), existing.latest_timestamp)
    });
    // an extension that leaves the latest view alone is not an update of it
    let last_updated_at = if latest_changed {
        ctx.now.max(existing.last_updated_at)
    } else {
        existing.last_updated_at
    };

    let patch = StatusPatch {
        message_id: existing.message_id.clone(),
        expected_status_count: existing.status_count,
        status_count: merged.len(),
        status_history: merged,
        latest_timestamp_formatted: format_in_zone(latest_timestamp, &ctx.zone),
        latest_status,
        latest_timestamp,
        workflow_id: ctx.workflow_id.clone(),
        last_updated_at,
        last_scanned_at,
    };

    let record = MessageStatusRecord {
        message_id: existing.message_id.clone(),
        conversation_id: existing.conversation_id.clone(),
        latest_status: patch.latest_status.clone(),
        latest_timestamp: patch.latest_timestamp,
        latest_timestamp_formatted: patch.latest_timestamp_formatted.clone(),
        status_history: patch.status_history.clone(),
        status_count: patch.status_count,
        workflow_id: patch.workflow_id.clone(),
        first_seen_at: existing.first_seen_at,
        last_updated_at: patch.last_updated_at,
        last_scanned_at: patch.last_scanned_at,
    };

    Reconciliation {
        outcome: ReconcileOutcome::Changed,
        mutation: Mutation::Patch(patch),
        record,
        novel_events,
    }
}

/// Presentation rendering of a provider timestamp in `zone`.
pub fn format_in_zone(timestamp: i64, zone: &Tz) -> Option<String> {
    zone.timestamp_opt(timestamp, 0)
        .single()
        .map(|moment| moment.format(FORMATTED_TIMESTAMP_PATTERN).to_string())
}
