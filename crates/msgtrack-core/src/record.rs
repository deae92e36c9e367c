use crate::status::{DeliveryStatus, StatusEvent};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Persisted per-message aggregate: full status history plus the latest view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub latest_status: DeliveryStatus,
    pub latest_timestamp: i64,
    #[serde(default)]
    pub latest_timestamp_formatted: Option<String>,
    pub status_history: Vec<StatusEvent>,
    pub status_count: usize,
    pub workflow_id: String,
    pub first_seen_at: DateTime<FixedOffset>,
    pub last_updated_at: DateTime<FixedOffset>,
    pub last_scanned_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordViolation {
    CountMismatch { status_count: usize, history_len: usize },
    DuplicateEntry { index: usize },
    OutOfOrder { index: usize },
    StaleLatest,
    EmptyHistory,
}

impl MessageStatusRecord {
    /// Chronologically last history entry, i.e. the source of the latest view.
    pub fn last_entry(&self) -> Option<&StatusEvent> {
        self.status_history.last()
    }

    /// Checks the structural invariants every persisted record must hold.
    pub fn violations(&self) -> Vec<RecordViolation> {
        let mut violations = Vec::new();
        if self.status_count != self.status_history.len() {
            violations.push(RecordViolation::CountMismatch {
                status_count: self.status_count,
                history_len: self.status_history.len(),
            });
        }

        let mut seen = HashSet::new();
        for (index, entry) in self.status_history.iter().enumerate() {
            if !seen.insert(entry.identity()) {
                violations.push(RecordViolation::DuplicateEntry { index });
            }
            if index > 0 && self.status_history[index - 1].timestamp > entry.timestamp {
                violations.push(RecordViolation::OutOfOrder { index });
            }
        }

        match self.last_entry() {
            Some(last) => {
                if last.status != self.latest_status || last.timestamp != self.latest_timestamp {
                    violations.push(RecordViolation::StaleLatest);
                }
            }
            None => violations.push(RecordViolation::EmptyHistory),
        }

        violations
    }

    pub fn is_consistent(&self) -> bool {
        self.violations().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(status: DeliveryStatus, timestamp: i64, execution_id: &str) -> StatusEvent {
        StatusEvent {
            message_id: "wamid.1".to_string(),
            conversation_id: "966500000001".to_string(),
            status,
            timestamp,
            execution_id: execution_id.to_string(),
        }
    }

    fn record(history: Vec<StatusEvent>) -> MessageStatusRecord {
        let moment = Utc
            .timestamp_opt(1_767_000_000, 0)
            .single()
            .expect("valid moment")
            .with_timezone(&FixedOffset::east_opt(3 * 3600).expect("offset"));
        let (latest_status, latest_timestamp) = history
            .last()
            .map(|last| (last.status.clone(), last.timestamp))
            .unwrap_or((DeliveryStatus::Sent, 0));
        MessageStatusRecord {
            message_id: "wamid.1".to_string(),
            conversation_id: "966500000001".to_string(),
            latest_status,
            latest_timestamp,
            latest_timestamp_formatted: None,
            status_count: history.len(),
            status_history: history,
            workflow_id: "wf-1".to_string(),
            first_seen_at: moment,
            last_updated_at: moment,
            last_scanned_at: moment,
        }
    }

    #[test]
    fn well_formed_record_has_no_violations() {
        let record = record(vec![
            entry(DeliveryStatus::Sent, 100, "1"),
            entry(DeliveryStatus::Delivered, 105, "2"),
        ]);
        assert!(record.is_consistent());
        assert_eq!(record.last_entry().map(|last| last.timestamp), Some(105));
    }

    #[test]
    fn violations_name_each_broken_invariant() {
        let mut broken = record(vec![
            entry(DeliveryStatus::Delivered, 105, "2"),
            entry(DeliveryStatus::Sent, 100, "1"),
            entry(DeliveryStatus::Sent, 100, "1"),
        ]);
        broken.status_count = 2;
        broken.latest_status = DeliveryStatus::Read;

        let violations = broken.violations();
        assert!(violations.contains(&RecordViolation::CountMismatch {
            status_count: 2,
            history_len: 3
        }));
        assert!(violations.contains(&RecordViolation::OutOfOrder { index: 1 }));
        assert!(violations.contains(&RecordViolation::DuplicateEntry { index: 2 }));
        assert!(violations.contains(&RecordViolation::StaleLatest));

        assert_eq!(record(Vec::new()).violations(), vec![RecordViolation::EmptyHistory]);
    }

    #[test]
    fn serializes_with_document_field_names() {
        let value = serde_json::to_value(record(vec![entry(DeliveryStatus::Read, 130, "7")]))
            .expect("serialize");
        assert_eq!(value["messageId"], "wamid.1");
        assert_eq!(value["latestStatus"], "read");
        assert_eq!(value["statusCount"], 1);
        assert_eq!(value["statusHistory"][0]["executionId"], "7");
        assert!(value.get("lastScannedAt").is_some());
    }
}
