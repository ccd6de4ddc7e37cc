//! Tool registry and sandboxed tool implementations.
//!
//! Tools are named capabilities (`shell`, `file`, ...) exposed to
//! workflows and agent code through a uniform `execute(params, ctx)`
//! contract. The registry wraps every call with parameter validation, a
//! timeout race, optional linear-backoff retries, duration stamping and
//! an in-memory execution log. Registries are constructed explicitly
//! and passed in; there is no global instance, so every run or test
//! gets isolated state.

mod file;
mod shell;

pub use file::FileTool;
pub use shell::{SessionSummary, ShellTool};

use crate::bounds::ExecutionLogSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default cap on the in-memory execution log ring.
const DEFAULT_LOG_CAPACITY: usize = 200;

/// Base delay for linear retry backoff: attempt N sleeps N of these.
const BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Machine-readable description of a tool, shaped for AI-driven
/// invocation (name, prose description, JSON-schema-style parameters).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Uniform result envelope every tool call produces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms: 0,
            metadata: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms: 0,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Ambient context passed to every tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub execution_id: Option<String>,
    pub workflow_id: Option<String>,
    /// Base directory relative paths resolve against (and the file
    /// tool's sandbox root). Defaults to the process working directory.
    pub working_dir: Option<PathBuf>,
}

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Wall-clock budget for one attempt; `None` means no limit.
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Set false to keep a call out of the execution log.
    pub log_execution: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            retries: 0,
            log_execution: true,
        }
    }
}

/// One `{tool, params}` pair for [`ToolRegistry::execute_sequence`] and
/// [`ToolRegistry::execute_parallel`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

/// Append-only record of one tool call attempt. Lives in the registry's
/// bounded ring, independent of any persisted execution history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolExecutionLog {
    pub execution_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub result: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The sandboxed-tool contract. Implementations must be cheap to share
/// (`Arc`) and safe to call concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Cheap, synchronous parameter check run before any side effect.
    /// Security rejections return messages containing "blocked".
    fn validate(&self, params: &Value) -> Result<(), String>;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// Name → tool map plus the execution-log ring. Construct one per run
/// (or share one per worker via `Arc`); never a global.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    log: Mutex<VecDeque<ToolExecutionLog>>,
    log_capacity: usize,
    sink: Option<Arc<dyn ExecutionLogSink>>,
    backoff_base: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            log: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_LOG_CAPACITY,
            sink: None,
            backoff_base: BACKOFF_BASE,
        }
    }

    /// Registry preloaded with the built-in `shell` and `file` tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellTool::new()));
        registry.register(Arc::new(FileTool::new()));
        registry
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ExecutionLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Shrink the retry backoff base; test-oriented.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        debug!(tool = %name, "registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Recent execution log entries, oldest first.
    pub fn execution_log(&self) -> Vec<ToolExecutionLog> {
        self.log
            .lock()
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run one tool call through validation, the timeout race and the
    /// retry loop. Never panics; every failure comes back as a
    /// `success:false` [`ToolResult`].
    pub async fn execute(
        &self,
        tool_name: &str,
        params: Value,
        ctx: &ToolContext,
        opts: &ExecuteOptions,
    ) -> ToolResult {
        let tool = match self.get(tool_name) {
            Some(tool) => tool,
            // A missing registration cannot be fixed by retrying.
            None => return ToolResult::fail(format!("tool '{tool_name}' is not registered")),
        };

        if let Err(e) = tool.validate(&params) {
            return ToolResult::fail(format!("invalid parameters for '{tool_name}': {e}"));
        }

        let mut result = ToolResult::fail("tool did not run");
        for attempt in 0..=opts.retries {
            let started_at = Utc::now();
            let start = Instant::now();

            result = match opts.timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, tool.execute(params.clone(), ctx)).await {
                        Ok(result) => result,
                        Err(_) => ToolResult::fail(format!(
                            "tool '{tool_name}' timed out after {}ms",
                            timeout.as_millis()
                        )),
                    }
                }
                None => tool.execute(params.clone(), ctx).await,
            };
            result.duration_ms = start.elapsed().as_millis() as u64;

            if opts.log_execution {
                self.record(tool_name, &params, &result, started_at, attempt)
                    .await;
            }

            if result.success || attempt == opts.retries {
                break;
            }

            let delay = self.backoff_base * (attempt + 1);
            warn!(
                tool = tool_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or(""),
                "tool call failed, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
        result
    }

    /// Run calls in order, stopping at the first failing result.
    pub async fn execute_sequence(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        opts: &ExecuteOptions,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.execute(&call.tool, call.params.clone(), ctx, opts).await;
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }

    /// Run calls concurrently; all results are returned regardless of
    /// individual failures.
    pub async fn execute_parallel(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        opts: &ExecuteOptions,
    ) -> Vec<ToolResult> {
        join_all(
            calls
                .iter()
                .map(|call| self.execute(&call.tool, call.params.clone(), ctx, opts)),
        )
        .await
    }

    async fn record(
        &self,
        tool_name: &str,
        params: &Value,
        result: &ToolResult,
        started_at: DateTime<Utc>,
        attempt: u32,
    ) {
        let entry = ToolExecutionLog {
            execution_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            parameters: params.clone(),
            result: json!({
                "success": result.success,
                "error": result.error,
                "attempt": attempt + 1,
            }),
            started_at,
            completed_at: Utc::now(),
            duration_ms: result.duration_ms,
        };

        if let Some(sink) = &self.sink {
            sink.log(&entry).await;
        }

        if let Ok(mut log) = self.log.lock() {
            if log.len() >= self.log_capacity {
                log.pop_front();
            }
            log.push_back(entry);
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Tool that fails a configurable number of times before succeeding.
    struct FlakyTool {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl FlakyTool {
        fn new(failures_before_success: u32) -> Self {
            Self {
                failures_before_success,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "flaky".to_string(),
                description: "fails N times then succeeds".to_string(),
                parameters: json!({}),
            }
        }

        fn validate(&self, _params: &Value) -> Result<(), String> {
            Ok(())
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                ToolResult::fail(format!("induced failure {}", call + 1))
            } else {
                ToolResult::ok(json!({"call": call + 1}))
            }
        }
    }

    /// Tool whose execute never resolves.
    struct StuckTool;

    #[async_trait]
    impl Tool for StuckTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "stuck".to_string(),
                description: "never finishes".to_string(),
                parameters: json!({}),
            }
        }

        fn validate(&self, _params: &Value) -> Result<(), String> {
            Ok(())
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn fast_registry() -> ToolRegistry {
        ToolRegistry::new().with_backoff_base(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_without_retry() {
        let registry = fast_registry();
        let result = registry
            .execute(
                "nope",
                json!({}),
                &ToolContext::default(),
                &ExecuteOptions::default(),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not registered"));
        assert!(registry.execution_log().is_empty());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let mut registry = fast_registry();
        registry.register(Arc::new(FlakyTool::new(2)));
        let opts = ExecuteOptions {
            retries: 2,
            ..Default::default()
        };
        let result = registry
            .execute("flaky", json!({}), &ToolContext::default(), &opts)
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["call"], 3);
        // One log entry per attempt.
        assert_eq!(registry.execution_log().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_returns_last_failure() {
        let mut registry = fast_registry();
        registry.register(Arc::new(FlakyTool::new(10)));
        let opts = ExecuteOptions {
            retries: 1,
            ..Default::default()
        };
        let result = registry
            .execute("flaky", json!({}), &ToolContext::default(), &opts)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("induced failure 2"));
    }

    #[tokio::test]
    async fn test_timeout_race() {
        let mut registry = fast_registry();
        registry.register(Arc::new(StuckTool));
        let opts = ExecuteOptions {
            timeout: Some(Duration::from_millis(50)),
            retries: 0,
            ..Default::default()
        };
        let start = Instant::now();
        let result = registry
            .execute("stuck", json!({}), &ToolContext::default(), &opts)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_log_ring_eviction() {
        let mut registry = fast_registry().with_log_capacity(2);
        registry.register(Arc::new(FlakyTool::new(0)));
        for _ in 0..5 {
            registry
                .execute(
                    "flaky",
                    json!({}),
                    &ToolContext::default(),
                    &ExecuteOptions::default(),
                )
                .await;
        }
        assert_eq!(registry.execution_log().len(), 2);
    }

    #[tokio::test]
    async fn test_log_suppression() {
        let mut registry = fast_registry();
        registry.register(Arc::new(FlakyTool::new(0)));
        let opts = ExecuteOptions {
            log_execution: false,
            ..Default::default()
        };
        registry
            .execute("flaky", json!({}), &ToolContext::default(), &opts)
            .await;
        assert!(registry.execution_log().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let mut registry = fast_registry();
        registry.register(Arc::new(FlakyTool::new(1)));
        let calls = vec![
            ToolCall {
                tool: "flaky".into(),
                params: json!({}),
            },
            ToolCall {
                tool: "flaky".into(),
                params: json!({}),
            },
        ];
        let results = registry
            .execute_sequence(&calls, &ToolContext::default(), &ExecuteOptions::default())
            .await;
        // First call fails (attempt 1), sequence stops there.
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
    }

    #[tokio::test]
    async fn test_parallel_returns_all_results() {
        let mut registry = fast_registry();
        registry.register(Arc::new(FlakyTool::new(1)));
        let calls = vec![
            ToolCall {
                tool: "flaky".into(),
                params: json!({}),
            },
            ToolCall {
                tool: "missing".into(),
                params: json!({}),
            },
            ToolCall {
                tool: "flaky".into(),
                params: json!({}),
            },
        ];
        let results = registry
            .execute_parallel(&calls, &ToolContext::default(), &ExecuteOptions::default())
            .await;
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_external_sink_receives_entries() {
        #[derive(Default)]
        struct CollectingSink {
            entries: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl ExecutionLogSink for CollectingSink {
            async fn log(&self, entry: &ToolExecutionLog) {
                self.entries.lock().unwrap().push(entry.tool_name.clone());
            }
        }

        let sink = Arc::new(CollectingSink::default());
        let mut registry = fast_registry().with_sink(sink.clone());
        registry.register(Arc::new(FlakyTool::new(0)));
        registry
            .execute(
                "flaky",
                json!({}),
                &ToolContext::default(),
                &ExecuteOptions::default(),
            )
            .await;
        assert_eq!(*sink.entries.lock().unwrap(), vec!["flaky".to_string()]);
    }

    #[tokio::test]
    async fn test_duration_is_stamped() {
        let mut registry = fast_registry();
        registry.register(Arc::new(FlakyTool::new(0)));
        let result = registry
            .execute(
                "flaky",
                json!({}),
                &ToolContext::default(),
                &ExecuteOptions::default(),
            )
            .await;
        // Sub-millisecond executions still stamp a (possibly zero) duration.
        assert!(result.duration_ms < 1000);
    }
}
