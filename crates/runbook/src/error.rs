//! Engine-level error type.
//!
//! Public envelope contracts ([`crate::expression::EvalOutcome`],
//! [`crate::tools::ToolResult`]) capture their own failures; this type
//! covers the fallible plumbing around them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("workflow has {0} steps, the maximum is {max}", max = crate::workflow::MAX_STEPS)]
    TooManySteps(usize),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}
