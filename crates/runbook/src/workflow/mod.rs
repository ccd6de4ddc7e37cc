//! Workflow definitions and the step-execution state machine.
//!
//! A workflow is an ordered list of typed steps executed against the
//! boundary collaborators in [`crate::bounds`]. Step configs are plain
//! serde data: the step kind is a tagged union, so dispatch in the
//! executor is an exhaustive match rather than runtime type sniffing.

mod executor;
mod substitute;

pub use executor::{ExecutorHandles, StepExecutor};
pub use substitute::substitute_variables;

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound on steps per workflow.
pub const MAX_STEPS: usize = 50;

/// The typed step variants. Serialized with a `type` tag and camelCase
/// field names, matching the stored workflow document format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum StepKind {
    Navigate {
        url: String,
    },
    Act {
        instruction: String,
    },
    Observe {
        instruction: String,
    },
    Extract {
        instruction: String,
        schema_type: Option<String>,
    },
    Wait {
        wait_ms: Option<u64>,
        selector: Option<String>,
    },
    Condition {
        expression: String,
        /// Branch steps run when the expression is truthy.
        #[serde(default)]
        steps: Vec<WorkflowStep>,
        /// When set and the expression is falsy, the remainder of the
        /// run is skipped instead of just this step's branch.
        #[serde(default)]
        skip_remaining: bool,
    },
    Loop {
        /// Array literal or a `{{variable}}` placeholder resolving to one.
        items: Value,
        /// Variable name each item is bound to; defaults to `item`.
        item_var: Option<String>,
        steps: Vec<WorkflowStep>,
    },
    ApiCall {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        body: Option<Value>,
        /// Variable name the parsed response body is saved under.
        save_as: Option<String>,
    },
    Notification {
        message: String,
        #[serde(default = "default_severity")]
        severity: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        params: Value,
    },
}

fn default_severity() -> String {
    "info".to_string()
}

/// One workflow step. `order` is advisory metadata carried from the
/// authoring UI; execution follows array order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// A stored workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::EmptyWorkflow);
        }
        if self.steps.len() > MAX_STEPS {
            return Err(EngineError::TooManySteps(self.steps.len()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geolocation {
    pub country: String,
    #[serde(default)]
    pub city: Option<String>,
}

/// Per-run mutable state. Created once per run; `variables` is written
/// by `apiCall` steps with `saveAs` and read by substitution everywhere.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub user_id: String,
    pub workflow_id: Option<String>,
    pub variables: Map<String, Value>,
    pub geolocation: Option<Geolocation>,
    pub step_by_step: bool,
}

impl ExecutionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Per-step outcome record; appended in step order and never mutated
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_index: usize,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// The run record: one per execution, status moves
/// `pending → running → exactly one terminal state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: Option<String>,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub step_results: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: Option<String>, user_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id,
            user_id,
            status: ExecutionStatus::Pending,
            step_results: Vec::new(),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// External cancellation signal, checked between steps. Cloneable so an
/// API layer can hold it keyed by execution id while the run proceeds.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_kind_round_trips_through_tagged_json() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "type": "apiCall",
            "order": 2,
            "method": "POST",
            "url": "https://api.example.com/items",
            "saveAs": "created",
            "continueOnError": true,
        }))
        .unwrap();
        assert!(step.continue_on_error);
        match &step.kind {
            StepKind::ApiCall { method, save_as, .. } => {
                assert_eq!(method, "POST");
                assert_eq!(save_as.as_deref(), Some("created"));
            }
            other => panic!("wrong kind: {other:?}"),
        }

        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "apiCall");
        assert_eq!(value["saveAs"], "created");
    }

    #[test]
    fn test_condition_step_defaults() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "type": "condition",
            "expression": "ready == true",
        }))
        .unwrap();
        match &step.kind {
            StepKind::Condition {
                steps,
                skip_remaining,
                ..
            } => {
                assert!(steps.is_empty());
                assert!(!skip_remaining);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_workflow_step_count_validation() {
        let step = WorkflowStep {
            order: 0,
            continue_on_error: false,
            kind: StepKind::Wait {
                wait_ms: Some(1),
                selector: None,
            },
        };
        let workflow = Workflow {
            id: None,
            name: "empty".into(),
            steps: vec![],
        };
        assert!(matches!(
            workflow.validate(),
            Err(EngineError::EmptyWorkflow)
        ));

        let workflow = Workflow {
            id: None,
            name: "big".into(),
            steps: vec![step; MAX_STEPS + 1],
        };
        assert!(matches!(
            workflow.validate(),
            Err(EngineError::TooManySteps(_))
        ));
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }
}
