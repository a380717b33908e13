//! DashScope multimodal generation client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::prompt::{build_prompt, parse_reply};
use super::{PreparedRow, ProcessError, ProcessSettings, RowInput, RowProcessor, precheck};
use crate::config::ServiceConfig;
use crate::runtime::types::Verdict;

/// Status codes worth another attempt after a backoff.
const RETRYABLE: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Judges rows by sending their screenshots to a DashScope vision model.
#[derive(Debug, Clone)]
pub struct DashScopeProcessor {
    client: Client,
    endpoint: String,
}

impl DashScopeProcessor {
    pub fn new(config: &ServiceConfig) -> Result<Self, ProcessError> {
        let client = Client::builder()
            .user_agent(concat!("refund-audit/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProcessError::ExternalService(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    async fn judge(
        &self,
        row: &RowInput,
        prepared: PreparedRow,
        settings: &ProcessSettings,
    ) -> Result<Verdict, ProcessError> {
        let mut content: Vec<Value> = prepared
            .image_urls
            .iter()
            .map(|url| json!({ "image": url }))
            .collect();
        content.push(json!({ "text": build_prompt(prepared.expected_amount) }));
        let body = json!({
            "model": settings.model_name,
            "input": { "messages": [{ "role": "user", "content": content }] },
        });

        let mut attempt: u32 = 0;
        loop {
            match self.call_once(&body, &settings.api_key).await {
                Ok(raw_text) => {
                    let judgment = parse_reply(&raw_text, prepared.expected_amount)?;
                    debug!(row_no = row.row_no, attempts = attempt + 1, "model reply parsed");
                    return Ok(Verdict {
                        is_match: judgment.is_match,
                        expected_amount: Some(prepared.expected_amount),
                        paid_amount: judgment.paid_amount,
                        reason: judgment.reason,
                        attempts: attempt + 1,
                        image_count: prepared.image_urls.len() as u32,
                        raw_text: Some(raw_text),
                    });
                }
                Err(CallError::Retryable(msg)) if attempt < settings.max_retries => {
                    let delay = settings.backoff_base_sec * 2f64.powi(attempt as i32);
                    warn!(
                        row_no = row.row_no,
                        attempt = attempt + 1,
                        delay_sec = delay,
                        error = %msg,
                        "judgment call failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
                    attempt += 1;
                }
                Err(CallError::Retryable(msg) | CallError::Fatal(ProcessError::ExternalService(msg))) => {
                    return Err(ProcessError::ExternalService(msg));
                }
                Err(CallError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// One HTTP exchange; returns the model's text.
    async fn call_once(&self, body: &Value, api_key: &str) -> Result<String, CallError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::Retryable(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CallError::Retryable(format!("failed to read response: {e}")))?;
        let payload: Option<Value> = serde_json::from_str(&text).ok();
        let code = payload
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = payload
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || code.contains("InvalidApiKey")
        {
            return Err(CallError::Fatal(ProcessError::Auth(
                format!("{status} {code} {message}").trim().to_owned(),
            )));
        }
        if !status.is_success() {
            let msg = format!("HTTP {status}: {code} {message}").trim().to_owned();
            return Err(if RETRYABLE.contains(&status) {
                CallError::Retryable(msg)
            } else {
                CallError::Fatal(ProcessError::ExternalService(msg))
            });
        }

        payload
            .as_ref()
            .and_then(extract_text)
            .ok_or_else(|| {
                CallError::Fatal(ProcessError::ExternalService(
                    "response carries no model text".into(),
                ))
            })
    }
}

enum CallError {
    Retryable(String),
    /// Not retried; `ExternalService` stays row-level, `Auth` stops the task.
    Fatal(ProcessError),
}

/// Pull `output.choices[0].message.content` text out of a generation reply.
fn extract_text(payload: &Value) -> Option<String> {
    let content = payload.pointer("/output/choices/0/message/content")?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::to_owned),
        _ => None,
    }
}

#[async_trait]
impl RowProcessor for DashScopeProcessor {
    async fn process(
        &self,
        row: &RowInput,
        settings: &ProcessSettings,
    ) -> Result<Verdict, ProcessError> {
        match precheck(row, settings.max_images) {
            Ok(prepared) => self.judge(row, prepared, settings).await,
            Err(verdict) => Ok(verdict),
        }
    }
}
