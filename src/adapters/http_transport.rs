//! HTTP delivery to agents
//!
//! `POST {endpoint}/assignments` carries the assignment JSON;
//! `POST {endpoint}/tasks/{id}/cancel` forwards a cancellation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::coordinator::AgentTransport;
use crate::domain::{Agent, AssignmentEvent, TaskId};
use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Whole-request timeout (ms)
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            connect_timeout_ms: 2000,
        }
    }
}

pub struct HttpTransport {
    http: Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;
        Ok(Self { http, config })
    }

    fn url(agent: &Agent, path: &str) -> String {
        format!("{}{}", agent.dispatch_endpoint().trim_end_matches('/'), path)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> std::result::Result<(), DispatchError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        debug!(url, status = status.as_u16(), body = %text, "agent refused request");
        Err(classify_status(status, text))
    }

    fn map_send_error(&self, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            DispatchError::Timeout {
                elapsed_ms: self.config.request_timeout_ms,
            }
        } else {
            DispatchError::Connection(e.to_string())
        }
    }
}

/// 507 signals memory pressure; 408, 429 and 5xx are worth retrying
/// elsewhere; any other 4xx means the agent will never accept the payload.
fn classify_status(status: StatusCode, body: String) -> DispatchError {
    match status.as_u16() {
        507 => DispatchError::ResourceExhausted(body),
        408 | 429 => DispatchError::Server {
            status: status.as_u16(),
        },
        code if status.is_client_error() => DispatchError::Rejected {
            status: code,
            reason: body,
        },
        code => DispatchError::Server { status: code },
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn deliver(
        &self,
        agent: &Agent,
        assignment: &AssignmentEvent,
    ) -> std::result::Result<(), DispatchError> {
        let url = Self::url(agent, "/assignments");
        self.post(&url, assignment).await
    }

    async fn cancel(&self, agent: &Agent, task_id: TaskId) -> std::result::Result<(), DispatchError> {
        let url = Self::url(agent, &format!("/tasks/{}/cancel", task_id));
        self.post(&url, &serde_json::json!({ "task_id": task_id })).await
    }
}
