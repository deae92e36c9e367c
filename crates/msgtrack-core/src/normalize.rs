use crate::error::MalformedEventError;
use crate::status::{DeliveryStatus, StatusEvent};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Status object as delivered by the provider webhook, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStatusEvent {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub recipient_id: Option<String>,
}

impl RawStatusEvent {
    /// Best-effort decode of an arbitrary JSON object. Fields with unexpected
    /// shapes are dropped so the normalizer reports what is missing.
    pub fn from_value(value: &Value) -> Self {
        if let Ok(parsed) = serde_json::from_value::<RawStatusEvent>(value.clone()) {
            return parsed;
        }
        let Some(object) = value.as_object() else {
            return Self::default();
        };
        Self {
            id: object.get("id").and_then(scalar_to_string),
            status: object
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            timestamp: object.get("timestamp").cloned(),
            recipient_id: object.get("recipient_id").and_then(scalar_to_string),
        }
    }
}

/// Turns one raw provider status into a canonical [`StatusEvent`].
///
/// A present conversation id is passed through even when it differs from
/// what the caller expected; only its total absence is rejected.
pub fn normalize(
    raw: &RawStatusEvent,
    execution_id: &str,
) -> Result<StatusEvent, MalformedEventError> {
    let message_id = non_empty(raw.id.as_deref()).ok_or(MalformedEventError::MissingMessageId)?;

    let status = non_empty(raw.status.as_deref())
        .and_then(|value| value.parse::<DeliveryStatus>().ok())
        .ok_or_else(|| MalformedEventError::MissingStatus {
            message_id: message_id.clone(),
        })?;

    let timestamp = match raw.timestamp.as_ref() {
        None | Some(Value::Null) => {
            return Err(MalformedEventError::MissingTimestamp { message_id })
        }
        Some(value) => parse_timestamp(value).ok_or_else(|| {
            MalformedEventError::InvalidTimestamp {
                message_id: message_id.clone(),
                raw: value.to_string(),
            }
        })?,
    };

    let conversation_id = non_empty(raw.recipient_id.as_deref()).ok_or_else(|| {
        MalformedEventError::MissingConversation {
            message_id: message_id.clone(),
        }
    })?;

    Ok(StatusEvent {
        message_id,
        conversation_id,
        status,
        timestamp,
        execution_id: execution_id.to_string(),
    })
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.is_finite())
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts an id given either as a string or as a number.
fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
