use msgtrack_core::{ExecutionBatch, RawStatusEvent};
use serde_json::Value;

const UNKNOWN_EXECUTION: &str = "unknown";

/// One page of `GET /executions`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPage {
    pub executions: Vec<Value>,
    pub next_cursor: Option<String>,
}

pub fn parse_page(body: &Value) -> Option<ExecutionPage> {
    let object = body.as_object()?;
    let executions = ["data", "executions"]
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| value.as_array().filter(|items| !items.is_empty()))
        .cloned()
        .unwrap_or_default();

    if executions.is_empty()
        && !object.contains_key("data")
        && !object.contains_key("executions")
    {
        return None;
    }

    let next_cursor = object
        .get("nextCursor")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string);

    Some(ExecutionPage {
        executions,
        next_cursor,
    })
}

pub fn execution_id(execution: &Value) -> String {
    match execution.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        _ => UNKNOWN_EXECUTION.to_string(),
    }
}

/// Walks every node run of an execution and collects the webhook `statuses`
/// objects in the order they appear.
///
/// Shapes that do not match the webhook layout are skipped silently; the
/// normalizer decides what counts as malformed.
pub fn extract_execution_batch(execution: &Value) -> ExecutionBatch {
    let mut statuses = Vec::new();

    let run_data = non_null(execution, "data")
        .or_else(|| non_null(execution, "executionData"))
        .and_then(|data| data.get("resultData"))
        .and_then(|result| result.get("runData"))
        .and_then(Value::as_object);

    if let Some(run_data) = run_data {
        for node_runs in run_data.values().filter_map(Value::as_array) {
            for run in node_runs {
                let Some(main) = run
                    .get("data")
                    .and_then(|data| data.get("main"))
                    .and_then(Value::as_array)
                else {
                    continue;
                };
                for output in main.iter().filter_map(Value::as_array) {
                    for item in output {
                        collect_item_statuses(item, &mut statuses);
                    }
                }
            }
        }
    }

    ExecutionBatch {
        execution_id: execution_id(execution),
        statuses,
    }
}

fn collect_item_statuses(item: &Value, statuses: &mut Vec<RawStatusEvent>) {
    let Some(json) = item.get("json") else {
        return;
    };
    let mut body = match json.get("body") {
        Some(body) if is_truthy(body) => body,
        _ => json,
    };
    if let Some(first) = body.as_array().and_then(|items| items.first()) {
        body = first;
    }

    let Some(entries) = body.get("statuses").and_then(Value::as_array) else {
        return;
    };
    statuses.extend(
        entries
            .iter()
            .filter(|entry| entry.is_object())
            .map(RawStatusEvent::from_value),
    );
}

fn non_null<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).filter(|inner| is_truthy(inner))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::Number(_) => true,
    }
}
