use msgtrack_core::{normalize, ExecutionBatch, SourceFilter, StatusEvent};
use std::collections::HashMap;
use tracing::warn;

/// Every event observed for one message during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub message_id: String,
    pub events: Vec<StatusEvent>,
}

impl MessageBatch {
    pub fn newest_timestamp(&self) -> Option<i64> {
        self.events.iter().map(|event| event.timestamp).max()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassPlan {
    pub executions_scanned: usize,
    pub events_observed: usize,
    pub malformed_events: usize,
    pub filtered_events: usize,
    pub messages: Vec<MessageBatch>,
}

/// Normalizes and groups fetched batches per message.
///
/// Executions arrive newest first; they are replayed oldest first so that
/// observation order follows the order the provider sent its webhooks.
/// Messages keep the order of their first observation unless
/// `max_messages` trims them, in which case the messages with the newest
/// events survive, newest first.
pub fn plan_pass(
    batches: &[ExecutionBatch],
    filter: &SourceFilter,
    max_messages: Option<usize>,
) -> PassPlan {
    let mut plan = PassPlan {
        executions_scanned: batches.len(),
        ..PassPlan::default()
    };
    let mut positions: HashMap<String, usize> = HashMap::new();

    for batch in batches.iter().rev() {
        for raw in &batch.statuses {
            plan.events_observed += 1;
            let event = match normalize(raw, &batch.execution_id) {
                Ok(event) => event,
                Err(err) => {
                    plan.malformed_events += 1;
                    warn!(
                        event = "malformed_status_event",
                        execution_id = %batch.execution_id,
                        error = %err
                    );
                    continue;
                }
            };
            if !filter.admits(&event) {
                plan.filtered_events += 1;
                continue;
            }

            match positions.get(&event.message_id) {
                Some(&index) => plan.messages[index].events.push(event),
                None => {
                    positions.insert(event.message_id.clone(), plan.messages.len());
                    plan.messages.push(MessageBatch {
                        message_id: event.message_id.clone(),
                        events: vec![event],
                    });
                }
            }
        }
    }

    if let Some(limit) = max_messages {
        if plan.messages.len() > limit {
            // stable: equal newest timestamps keep first-observation order
            plan.messages
                .sort_by(|left, right| right.newest_timestamp().cmp(&left.newest_timestamp()));
            plan.messages.truncate(limit);
        }
    }

    plan
}
