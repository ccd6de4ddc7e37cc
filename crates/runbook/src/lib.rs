//! Runbook: a workflow automation engine.
//!
//! Runs multi-step browser/API workflows on behalf of a user. The three
//! load-bearing pieces are:
//!
//! - [`expression`]: a safe, hand-written evaluator for the boolean
//!   condition language used by branching steps;
//! - [`workflow`]: the step-execution state machine with per-run
//!   variables, `{{placeholder}}` substitution and per-step failure
//!   policy;
//! - [`tools`]: the registry of sandboxed tools (`shell`, `file`)
//!   with timeouts, retries and execution logging.
//!
//! Everything side-effecting goes through the boundary traits in
//! [`bounds`], so runs are testable against in-memory fakes.
//!
//! ```no_run
//! use runbook::bounds::{NoopActuator, ReqwestHttpClient, TracingNotificationSink};
//! use runbook::tools::ToolRegistry;
//! use runbook::workflow::{ExecutionContext, ExecutorHandles, StepExecutor, Workflow};
//! use std::sync::Arc;
//!
//! # async fn demo(workflow: Workflow) -> Result<(), runbook::EngineError> {
//! let executor = StepExecutor::new(ExecutorHandles {
//!     actuator: Arc::new(NoopActuator::new()),
//!     http: Arc::new(ReqwestHttpClient::new()),
//!     notifier: Arc::new(TracingNotificationSink),
//!     registry: Arc::new(ToolRegistry::with_builtins()),
//! });
//! let mut ctx = ExecutionContext::new("user-1");
//! let execution = executor.test_execute(&workflow, &mut ctx).await?;
//! println!("{:?}", execution.status);
//! # Ok(())
//! # }
//! ```

pub mod bounds;
pub mod error;
pub mod expression;
pub mod tools;
pub mod workflow;

pub use error::EngineError;
