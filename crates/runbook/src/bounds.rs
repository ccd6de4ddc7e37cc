//! Boundary contracts the engine executes against.
//!
//! The executor never talks to a browser, the network, a database or a
//! notification channel directly. It goes through these traits so a
//! test or dry run can swap in [`NoopActuator`] and [`MemoryStore`]
//! while production wires up real backends. This replaces the original
//! system's global singleton clients with explicitly injected
//! collaborators.

use crate::error::EngineError;
use crate::workflow::{ExecutionStatus, Workflow, WorkflowExecution};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Browser-automation backend: performs the `navigate`/`act`/`observe`/
/// `extract`/`wait` step kinds against a live session.
#[async_trait]
pub trait BrowserActuator: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<Value, String>;
    async fn act(&self, instruction: &str) -> Result<Value, String>;
    async fn observe(&self, instruction: &str) -> Result<Value, String>;
    async fn extract(&self, instruction: &str, schema_hint: Option<&str>) -> Result<Value, String>;
    async fn wait_for(&self, selector: Option<&str>, wait_ms: Option<u64>) -> Result<Value, String>;
}

/// HTTP client used by `apiCall` steps.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
    ) -> Result<HttpResponse, String>;
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

/// Sink for `notification` steps.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str, severity: &str) -> Result<(), String>;
}

/// Create/read/update store for workflow execution records. Production
/// backs this with a relational store; the engine only needs id-keyed
/// semantics.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, EngineError>;
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError>;
    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), EngineError>;
    async fn load_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, EngineError>;
}

/// Optional callback invoked with every tool execution log entry, on
/// top of the registry's in-memory ring.
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    async fn log(&self, entry: &crate::tools::ToolExecutionLog);
}

/// `reqwest`-backed [`HttpClient`].
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
    ) -> Result<HttpResponse, String> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| format!("invalid HTTP method '{method}': {e}"))?;
        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {e}"))?;
        // Non-JSON bodies are preserved as plain strings.
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(HttpResponse { status, body })
    }
}

/// Actuator that records calls and returns canned success. Backs dry
/// runs and tests where no browser session exists.
#[derive(Default)]
pub struct NoopActuator {
    calls: Mutex<Vec<String>>,
}

impl NoopActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions performed so far, in order, e.g. `navigate https://x`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) -> Result<Value, String> {
        info!(call = %call, "noop actuator");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(json!({"simulated": true}))
    }
}

#[async_trait]
impl BrowserActuator for NoopActuator {
    async fn navigate(&self, url: &str) -> Result<Value, String> {
        self.record(format!("navigate {url}"))
    }

    async fn act(&self, instruction: &str) -> Result<Value, String> {
        self.record(format!("act {instruction}"))
    }

    async fn observe(&self, instruction: &str) -> Result<Value, String> {
        self.record(format!("observe {instruction}"))
    }

    async fn extract(&self, instruction: &str, schema_hint: Option<&str>) -> Result<Value, String> {
        self.record(format!(
            "extract {instruction} schema={}",
            schema_hint.unwrap_or("none")
        ))
    }

    async fn wait_for(&self, selector: Option<&str>, wait_ms: Option<u64>) -> Result<Value, String> {
        if let Some(ms) = wait_ms {
            // Dry runs still honor explicit waits, capped to keep tests fast.
            tokio::time::sleep(std::time::Duration::from_millis(ms.min(50))).await;
        }
        self.record(format!("wait selector={selector:?} ms={wait_ms:?}"))
    }
}

/// Notification sink that forwards to `tracing` at the mapped level.
#[derive(Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, message: &str, severity: &str) -> Result<(), String> {
        match severity {
            "error" | "critical" => error!(target: "runbook::notify", "{message}"),
            "warning" | "warn" => warn!(target: "runbook::notify", "{message}"),
            _ => info!(target: "runbook::notify", "{message}"),
        }
        Ok(())
    }
}

/// In-memory [`PersistenceStore`] for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<String, Workflow>>,
    executions: Mutex<HashMap<String, WorkflowExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a workflow definition. Definitions without an id are not
    /// addressable and are ignored.
    pub fn put_workflow(&self, workflow: Workflow) {
        let Some(id) = workflow.id.clone() else {
            return;
        };
        if let Ok(mut workflows) = self.workflows.lock() {
            workflows.insert(id, workflow);
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, EngineError> {
        let workflows = self
            .workflows
            .lock()
            .map_err(|_| EngineError::Persistence("workflow store poisoned".into()))?;
        Ok(workflows.get(id).cloned())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError> {
        let mut executions = self
            .executions
            .lock()
            .map_err(|_| EngineError::Persistence("execution store poisoned".into()))?;
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let mut executions = self
            .executions
            .lock()
            .map_err(|_| EngineError::Persistence("execution store poisoned".into()))?;
        match executions.get_mut(id) {
            Some(execution) => {
                execution.status = status;
                if error.is_some() {
                    execution.error = error;
                }
                Ok(())
            }
            None => Err(EngineError::ExecutionNotFound(id.to_string())),
        }
    }

    async fn load_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, EngineError> {
        let executions = self
            .executions
            .lock()
            .map_err(|_| EngineError::Persistence("execution store poisoned".into()))?;
        Ok(executions.get(id).cloned())
    }
}
