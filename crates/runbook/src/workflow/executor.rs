//! The step-execution state machine.
//!
//! One executor instance serves many runs; all per-run state lives in
//! the [`ExecutionContext`] and the [`WorkflowExecution`] record built
//! here. Steps run strictly sequentially, since later steps may depend
//! on variables written by earlier ones, and every boundary call goes
//! through the injected collaborators in [`ExecutorHandles`].

use super::{
    substitute_variables, CancellationFlag, ExecutionContext, ExecutionStatus, StepKind,
    StepResult, StepStatus, Workflow, WorkflowStep,
};
use crate::bounds::{BrowserActuator, HttpClient, NotificationSink, PersistenceStore};
use crate::error::EngineError;
use crate::expression;
use crate::tools::{ExecuteOptions, ToolContext, ToolRegistry};
use crate::workflow::WorkflowExecution;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// The boundary collaborators a run executes against. Constructed by
/// the caller and injected; no global clients.
#[derive(Clone)]
pub struct ExecutorHandles {
    pub actuator: Arc<dyn BrowserActuator>,
    pub http: Arc<dyn HttpClient>,
    pub notifier: Arc<dyn NotificationSink>,
    pub registry: Arc<ToolRegistry>,
}

pub struct StepExecutor {
    handles: ExecutorHandles,
    store: Option<Arc<dyn PersistenceStore>>,
}

/// What a single step produced, before it is frozen into a [`StepResult`].
struct StepOutcome {
    status: StepStatus,
    result: Option<Value>,
    error: Option<String>,
    /// Set by a falsy `condition` step with `skipRemaining`.
    skip_remaining: bool,
}

impl StepOutcome {
    fn success(result: Value) -> Self {
        Self {
            status: StepStatus::Success,
            result: Some(result),
            error: None,
            skip_remaining: false,
        }
    }

    fn failed(error: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            status: StepStatus::Failed,
            result,
            error: Some(error.into()),
            skip_remaining: false,
        }
    }

    fn skipped(result: Value, skip_remaining: bool) -> Self {
        Self {
            status: StepStatus::Skipped,
            result: Some(result),
            error: None,
            skip_remaining,
        }
    }
}

impl StepExecutor {
    pub fn new(handles: ExecutorHandles) -> Self {
        Self {
            handles,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run a workflow with persistence (when a store is configured).
    pub async fn execute(
        &self,
        workflow: &Workflow,
        ctx: &mut ExecutionContext,
        cancel: &CancellationFlag,
    ) -> Result<WorkflowExecution, EngineError> {
        self.run(workflow, ctx, cancel, true).await
    }

    /// Dry-run path: the identical state machine with persistence
    /// skipped, for validating workflows before they are saved.
    pub async fn test_execute(
        &self,
        workflow: &Workflow,
        ctx: &mut ExecutionContext,
    ) -> Result<WorkflowExecution, EngineError> {
        self.run(workflow, ctx, &CancellationFlag::new(), false).await
    }

    async fn run(
        &self,
        workflow: &Workflow,
        ctx: &mut ExecutionContext,
        cancel: &CancellationFlag,
        persist: bool,
    ) -> Result<WorkflowExecution, EngineError> {
        workflow.validate()?;

        let workflow_id = ctx.workflow_id.clone().or_else(|| workflow.id.clone());
        let mut execution = WorkflowExecution::new(workflow_id, ctx.user_id.clone());
        let span = info_span!(
            "execute_workflow",
            execution_id = %execution.id,
            workflow = %workflow.name,
        );

        let store = if persist { self.store.as_ref() } else { None };
        if let Some(store) = store {
            store.save_execution(&execution).await?;
        }
        execution.status = ExecutionStatus::Running;
        if let Some(store) = store {
            store
                .update_execution_status(&execution.id, ExecutionStatus::Running, None)
                .await?;
        }

        async {
            let total = workflow.steps.len();
            for (index, step) in workflow.steps.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!(step_index = index, "execution cancelled at step boundary");
                    execution.status = ExecutionStatus::Cancelled;
                    break;
                }

                info!(
                    "Step {} BEGIN kind='{}' continue_on_error={} ({} of {})",
                    index,
                    kind_name(&step.kind),
                    step.continue_on_error,
                    index + 1,
                    total,
                );
                let start = Instant::now();
                let outcome = self.run_step(step, ctx, &execution.id).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                let failed = outcome.status == StepStatus::Failed;
                let skip_remaining = outcome.skip_remaining;
                let step_error = outcome.error.clone();
                execution.step_results.push(StepResult {
                    step_index: index,
                    status: outcome.status,
                    result: outcome.result,
                    error: outcome.error,
                    duration_ms,
                });
                info!(
                    "Step {} END status={:?} duration_ms={}",
                    index,
                    execution.step_results[index].status,
                    duration_ms,
                );

                if skip_remaining {
                    // A falsy gate with skipRemaining ends the run early;
                    // the untouched steps are recorded as skipped.
                    for rest in index + 1..total {
                        execution.step_results.push(StepResult {
                            step_index: rest,
                            status: StepStatus::Skipped,
                            result: Some(json!({"skippedBy": index})),
                            error: None,
                            duration_ms: 0,
                        });
                    }
                    break;
                }

                if failed && !step.continue_on_error {
                    warn!(step_index = index, error = step_error.as_deref().unwrap_or(""), "step failed, stopping run");
                    execution.status = ExecutionStatus::Failed;
                    execution.error = step_error;
                    break;
                }
            }
            if execution.status == ExecutionStatus::Running {
                execution.status = ExecutionStatus::Completed;
            }
        }
        .instrument(span)
        .await;

        execution.completed_at = Some(chrono::Utc::now());
        execution.output = execution
            .step_results
            .iter()
            .rev()
            .find(|r| r.status == StepStatus::Success)
            .and_then(|r| r.result.clone());

        if let Some(store) = store {
            store
                .update_execution_status(&execution.id, execution.status, execution.error.clone())
                .await?;
            store.save_execution(&execution).await?;
        }
        info!(
            execution_id = %execution.id,
            status = ?execution.status,
            steps = execution.step_results.len(),
            "workflow run finished"
        );
        Ok(execution)
    }

    /// Execute one step: substitute variables into a per-run clone of
    /// its config, then dispatch on the kind. Boxed for the recursion
    /// through `condition` branches and `loop` bodies.
    fn run_step<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a mut ExecutionContext,
        execution_id: &'a str,
    ) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            match &step.kind {
                StepKind::Condition {
                    expression: expr,
                    steps,
                    skip_remaining,
                } => {
                    self.run_condition(expr, steps, *skip_remaining, ctx, execution_id)
                        .await
                }
                StepKind::Loop {
                    items,
                    item_var,
                    steps,
                } => {
                    self.run_loop(items, item_var.as_deref(), steps, ctx, execution_id)
                        .await
                }
                // Remaining kinds carry only scalar config: substitute
                // through a serialized clone, the definition stays untouched.
                kind => {
                    let mut config = match serde_json::to_value(kind) {
                        Ok(config) => config,
                        Err(e) => return StepOutcome::failed(format!("unserializable step: {e}"), None),
                    };
                    substitute_variables(&mut config, &ctx.variables);
                    let resolved: StepKind = match serde_json::from_value(config) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            return StepOutcome::failed(
                                format!("step config invalid after substitution: {e}"),
                                None,
                            )
                        }
                    };
                    self.dispatch_leaf(resolved, ctx, execution_id).await
                }
            }
        })
    }

    async fn dispatch_leaf(
        &self,
        kind: StepKind,
        ctx: &mut ExecutionContext,
        execution_id: &str,
    ) -> StepOutcome {
        match kind {
            StepKind::Navigate { url } => actuator_outcome(self.handles.actuator.navigate(&url).await),
            StepKind::Act { instruction } => {
                actuator_outcome(self.handles.actuator.act(&instruction).await)
            }
            StepKind::Observe { instruction } => {
                actuator_outcome(self.handles.actuator.observe(&instruction).await)
            }
            StepKind::Extract {
                instruction,
                schema_type,
            } => actuator_outcome(
                self.handles
                    .actuator
                    .extract(&instruction, schema_type.as_deref())
                    .await,
            ),
            StepKind::Wait { wait_ms, selector } => actuator_outcome(
                self.handles
                    .actuator
                    .wait_for(selector.as_deref(), wait_ms)
                    .await,
            ),
            StepKind::ApiCall {
                method,
                url,
                headers,
                body,
                save_as,
            } => {
                let response = self
                    .handles
                    .http
                    .request(&method, &url, &headers, body.as_ref())
                    .await;
                match response {
                    Ok(response) if response.status < 400 => {
                        if let Some(name) = save_as {
                            debug!(variable = %name, "saving apiCall response into run variables");
                            ctx.variables.insert(name, response.body.clone());
                        }
                        StepOutcome::success(json!({
                            "status": response.status,
                            "body": response.body,
                        }))
                    }
                    Ok(response) => StepOutcome::failed(
                        format!("HTTP {} from {method} {url}", response.status),
                        Some(json!({"status": response.status, "body": response.body})),
                    ),
                    Err(e) => StepOutcome::failed(format!("{method} {url} failed: {e}"), None),
                }
            }
            StepKind::Notification { message, severity } => {
                match self.handles.notifier.notify(&message, &severity).await {
                    Ok(()) => StepOutcome::success(json!({"notified": true})),
                    Err(e) => StepOutcome::failed(format!("notification failed: {e}"), None),
                }
            }
            StepKind::Tool { tool, params } => {
                let tool_ctx = ToolContext {
                    execution_id: Some(execution_id.to_string()),
                    workflow_id: ctx.workflow_id.clone(),
                    working_dir: None,
                };
                let result = self
                    .handles
                    .registry
                    .execute(&tool, params, &tool_ctx, &ExecuteOptions::default())
                    .await;
                if result.success {
                    StepOutcome::success(result.data.unwrap_or(Value::Null))
                } else {
                    StepOutcome::failed(
                        result.error.unwrap_or_else(|| "tool failed".into()),
                        result.data,
                    )
                }
            }
            // Handled by run_step before dispatch.
            StepKind::Condition { .. } | StepKind::Loop { .. } => {
                StepOutcome::failed("nested dispatch error", None)
            }
        }
    }

    async fn run_condition(
        &self,
        expr: &str,
        steps: &[WorkflowStep],
        skip_remaining: bool,
        ctx: &mut ExecutionContext,
        execution_id: &str,
    ) -> StepOutcome {
        // The expression string itself may carry placeholders.
        let mut resolved = Value::String(expr.to_string());
        substitute_variables(&mut resolved, &ctx.variables);
        let resolved = match &resolved {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let outcome = expression::evaluate(&resolved, &ctx.variables);
        if !outcome.success {
            // An unevaluable gate skips its branch rather than failing
            // the run; the error is surfaced in the step payload.
            warn!(expression = %resolved, error = outcome.error.as_deref().unwrap_or(""), "condition expression failed to evaluate");
            return StepOutcome::skipped(
                json!({"condition": false, "evalError": outcome.error}),
                skip_remaining,
            );
        }
        if !outcome.result {
            debug!(expression = %resolved, "condition is false, skipping branch");
            return StepOutcome::skipped(json!({"condition": false}), skip_remaining);
        }

        if steps.is_empty() {
            return StepOutcome::success(json!({"condition": true}));
        }
        match self.run_branch(steps, ctx, execution_id).await {
            Ok(branch) => StepOutcome::success(json!({"condition": true, "branch": branch})),
            Err((branch, error)) => StepOutcome::failed(
                error,
                Some(json!({"condition": true, "branch": branch})),
            ),
        }
    }

    async fn run_loop(
        &self,
        items: &Value,
        item_var: Option<&str>,
        steps: &[WorkflowStep],
        ctx: &mut ExecutionContext,
        execution_id: &str,
    ) -> StepOutcome {
        let mut resolved = items.clone();
        substitute_variables(&mut resolved, &ctx.variables);
        let items = match coerce_items(resolved) {
            Some(items) => items,
            None => return StepOutcome::failed("loop items did not resolve to an array", None),
        };

        let var_name = item_var.unwrap_or("item").to_string();
        let previous = ctx.variables.get(&var_name).cloned();
        let mut iterations = Vec::new();
        let mut failure = None;

        for (i, item) in items.iter().enumerate() {
            ctx.variables.insert(var_name.clone(), item.clone());
            match self.run_branch(steps, ctx, execution_id).await {
                Ok(branch) => iterations.push(json!({"index": i, "results": branch})),
                Err((branch, error)) => {
                    iterations.push(json!({"index": i, "results": branch, "error": error.clone()}));
                    failure = Some(format!("loop iteration {i} failed: {error}"));
                    break;
                }
            }
        }

        // Restore whatever the loop variable shadowed.
        match previous {
            Some(value) => {
                ctx.variables.insert(var_name, value);
            }
            None => {
                ctx.variables.remove(&var_name);
            }
        }

        let result = json!({"iterations": iterations.len(), "items": items.len(), "results": iterations});
        match failure {
            Some(error) => StepOutcome::failed(error, Some(result)),
            None => StepOutcome::success(result),
        }
    }

    /// Run nested steps (a condition branch or one loop iteration).
    /// Honors each nested step's `continueOnError`; the first
    /// unforgiven failure aborts the branch.
    async fn run_branch(
        &self,
        steps: &[WorkflowStep],
        ctx: &mut ExecutionContext,
        execution_id: &str,
    ) -> Result<Vec<Value>, (Vec<Value>, String)> {
        let mut summaries = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let start = Instant::now();
            let outcome = self.run_step(step, ctx, execution_id).await;
            summaries.push(json!({
                "index": i,
                "status": outcome.status,
                "result": outcome.result,
                "error": outcome.error.clone(),
                "durationMs": start.elapsed().as_millis() as u64,
            }));
            if outcome.status == StepStatus::Failed && !step.continue_on_error {
                let error = outcome
                    .error
                    .unwrap_or_else(|| format!("nested step {i} failed"));
                return Err((summaries, error));
            }
            if outcome.skip_remaining {
                break;
            }
        }
        Ok(summaries)
    }
}

fn actuator_outcome(result: Result<Value, String>) -> StepOutcome {
    match result {
        Ok(value) => StepOutcome::success(value),
        Err(e) => StepOutcome::failed(e, None),
    }
}

fn coerce_items(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        // A placeholder may have interpolated into a JSON-encoded array.
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .ok()
            .and_then(|v| v.as_array().cloned()),
        _ => None,
    }
}

fn kind_name(kind: &StepKind) -> &'static str {
    match kind {
        StepKind::Navigate { .. } => "navigate",
        StepKind::Act { .. } => "act",
        StepKind::Observe { .. } => "observe",
        StepKind::Extract { .. } => "extract",
        StepKind::Wait { .. } => "wait",
        StepKind::Condition { .. } => "condition",
        StepKind::Loop { .. } => "loop",
        StepKind::ApiCall { .. } => "apiCall",
        StepKind::Notification { .. } => "notification",
        StepKind::Tool { .. } => "tool",
    }
}
