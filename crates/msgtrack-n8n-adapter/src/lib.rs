pub mod extract;
pub mod retry;

use crate::extract::{extract_execution_batch, parse_page, ExecutionPage};
use crate::retry::{Attempt, RetryPolicy};
use msgtrack_core::{EventSource, ExecutionBatch, SourceError, SourceFilter};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use extract::execution_id;
pub use retry::is_transient_status;

pub const DEFAULT_API_PREFIX: &str = "/api/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// n8n caps `limit` per request at this value.
pub const MAX_PAGE_SIZE: usize = 100;
const API_KEY_HEADER: &str = "X-N8N-API-KEY";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("n8n base url is not configured")]
    MissingBaseUrl,
    #[error("authentication required: set N8N_API_KEY or N8N_BASIC_USER + N8N_BASIC_PASS")]
    MissingCredentials,
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Clone, PartialEq, Eq)]
pub enum N8nAuth {
    ApiKey(String),
    Basic { user: String, password: String },
}

impl std::fmt::Debug for N8nAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            N8nAuth::ApiKey(_) => f.write_str("ApiKey(***)"),
            N8nAuth::Basic { user, .. } => write!(f, "Basic({user}:***)"),
        }
    }
}

impl N8nAuth {
    /// API key wins over basic credentials when both are present.
    pub fn from_parts(
        api_key: Option<&str>,
        basic_user: Option<&str>,
        basic_password: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        if let Some(key) = present(api_key) {
            return Ok(N8nAuth::ApiKey(key));
        }
        match (present(basic_user), present(basic_password)) {
            (Some(user), Some(password)) => Ok(N8nAuth::Basic { user, password }),
            _ => Err(AdapterError::MissingCredentials),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N8nConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub auth: N8nAuth,
    pub workflow_id: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl N8nConfig {
    pub fn new(base_url: &str, auth: N8nAuth, workflow_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            auth,
            workflow_id: workflow_id.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_api_prefix(mut self, prefix: &str) -> Self {
        let trimmed = prefix.trim().trim_end_matches('/');
        self.api_prefix = if trimmed.is_empty() || trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        self
    }

    pub fn executions_url(&self) -> String {
        format!("{}{}/executions", self.base_url, self.api_prefix)
    }
}

/// Reads WhatsApp status webhooks out of n8n execution history.
pub struct N8nExecutionSource {
    client: Client,
    config: N8nConfig,
}

impl N8nExecutionSource {
    pub fn new(config: N8nConfig) -> Result<Self, AdapterError> {
        if config.base_url.is_empty() {
            return Err(AdapterError::MissingBaseUrl);
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn fetch_page(&self, cursor: Option<&str>, page_size: usize) -> Result<Value, SourceError> {
        let url = self.config.executions_url();
        let mut query: Vec<(&str, String)> = vec![
            ("workflowId", self.config.workflow_id.clone()),
            ("limit", page_size.to_string()),
            ("includeData", "true".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response = self.config.retry.run(
            |attempt| {
                let request = self.client.get(&url).query(&query);
                let request = match &self.config.auth {
                    N8nAuth::ApiKey(key) => request.header(API_KEY_HEADER, key),
                    N8nAuth::Basic { user, password } => request.basic_auth(user, Some(password)),
                };
                match request.header("Accept", "application/json").send() {
                    Ok(response) if is_transient_status(response.status()) => {
                        let status = response.status();
                        let body = truncated_body(response.text().unwrap_or_default());
                        Attempt::Retry(SourceError::Unavailable(format!(
                            "attempt {attempt}: HTTP {}: {body}",
                            status.as_u16()
                        )))
                    }
                    Ok(response) => Attempt::Done(response),
                    Err(err) => Attempt::Retry(SourceError::Unavailable(format!(
                        "attempt {attempt}: {err}"
                    ))),
                }
            },
            |attempt, delay, err| {
                warn!(
                    event = "n8n_request_retry",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                std::thread::sleep(delay);
            },
        )?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = truncated_body(response.text().unwrap_or_default());
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .map_err(|err| SourceError::InvalidPayload(err.to_string()))
    }
}

impl EventSource for N8nExecutionSource {
    fn fetch(&self, filter: &SourceFilter) -> Result<Vec<ExecutionBatch>, SourceError> {
        let executions = collect_executions(filter.max_executions, |cursor, page_size| {
            let body = self.fetch_page(cursor, page_size)?;
            parse_page(&body).ok_or_else(|| {
                SourceError::InvalidPayload("executions response has no data array".to_string())
            })
        })?;

        let batches: Vec<ExecutionBatch> = executions.iter().map(extract_execution_batch).collect();
        info!(
            event = "n8n_executions_fetched",
            workflow_id = %self.config.workflow_id,
            executions = batches.len(),
            statuses = batches.iter().map(|batch| batch.statuses.len()).sum::<usize>()
        );
        Ok(batches)
    }
}

/// Follows `nextCursor` until `limit` executions are collected or the
/// server runs out of pages.
pub fn collect_executions<F>(limit: usize, mut fetch_page: F) -> Result<Vec<Value>, SourceError>
where
    F: FnMut(Option<&str>, usize) -> Result<ExecutionPage, SourceError>,
{
    let mut executions: Vec<Value> = Vec::new();
    let mut cursor: Option<String> = None;

    while executions.len() < limit {
        let page_size = (limit - executions.len()).min(MAX_PAGE_SIZE);
        let page = fetch_page(cursor.as_deref(), page_size)?;
        debug!(
            event = "n8n_page_fetched",
            received = page.executions.len(),
            has_more = page.next_cursor.is_some()
        );

        let exhausted = page.executions.is_empty();
        executions.extend(page.executions);
        cursor = page.next_cursor;
        if cursor.is_none() || exhausted {
            break;
        }
    }

    executions.truncate(limit);
    Ok(executions)
}

fn truncated_body(body: String) -> String {
    const MAX_BODY_CHARS: usize = 200;
    if body.chars().count() <= MAX_BODY_CHARS {
        return body;
    }
    body.chars().take(MAX_BODY_CHARS).collect()
}
