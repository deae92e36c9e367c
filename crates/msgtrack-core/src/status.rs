use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery status reported by the messaging provider.
///
/// Unknown tokens are kept verbatim (lowercased) in `Other` so new provider
/// statuses flow through without a code change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
    Undelivered,
    Other(String),
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Undelivered => "undelivered",
            DeliveryStatus::Other(value) => value.as_str(),
        }
    }

    /// Terminal statuses will not be followed by further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Read | DeliveryStatus::Failed | DeliveryStatus::Undelivered
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err("empty status".to_string()),
            "queued" => Ok(DeliveryStatus::Queued),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            "undelivered" => Ok(DeliveryStatus::Undelivered),
            _ => Ok(DeliveryStatus::Other(normalized)),
        }
    }
}

impl From<String> for DeliveryStatus {
    fn from(value: String) -> Self {
        value
            .parse()
            .unwrap_or_else(|_| DeliveryStatus::Other(value))
    }
}

impl From<DeliveryStatus> for String {
    fn from(value: DeliveryStatus) -> Self {
        value.as_str().to_string()
    }
}

/// One observed status transition for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub message_id: String,
    pub conversation_id: String,
    pub status: DeliveryStatus,
    /// Seconds since the Unix epoch, as reported by the provider.
    pub timestamp: i64,
    pub execution_id: String,
}

/// Deduplication identity of a [`StatusEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventIdentity {
    pub status: DeliveryStatus,
    pub timestamp: i64,
    pub execution_id: String,
}

impl StatusEvent {
    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            status: self.status.clone(),
            timestamp: self.timestamp,
            execution_id: self.execution_id.clone(),
        }
    }
}
