use crate::error::SourceError;
use crate::normalize::RawStatusEvent;
use crate::status::StatusEvent;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EXECUTIONS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    pub conversation_id: Option<String>,
    /// Oldest provider timestamp (epoch seconds) still of interest.
    pub since: Option<i64>,
    pub max_executions: usize,
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self {
            conversation_id: None,
            since: None,
            max_executions: DEFAULT_MAX_EXECUTIONS,
        }
    }
}

impl SourceFilter {
    pub fn admits(&self, event: &StatusEvent) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        match self.conversation_id.as_deref() {
            Some(conversation_id) => event.conversation_id == conversation_id,
            None => true,
        }
    }
}

/// Raw statuses found in one workflow execution, in observation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub execution_id: String,
    pub statuses: Vec<RawStatusEvent>,
}

/// Pull interface over the workflow API. Batches come back most recent
/// execution first.
pub trait EventSource {
    fn fetch(&self, filter: &SourceFilter) -> Result<Vec<ExecutionBatch>, SourceError>;
}

impl<T: EventSource + ?Sized> EventSource for &T {
    fn fetch(&self, filter: &SourceFilter) -> Result<Vec<ExecutionBatch>, SourceError> {
        (**self).fetch(filter)
    }
}
