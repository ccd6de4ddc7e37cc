//! Safe condition-expression evaluator.
//!
//! Workflow conditions are user-authored strings like
//! `status == "active" && user.credits > 0`. They are evaluated by a
//! hand-written tokenizer, recursive-descent parser and AST walker,
//! never by any host `eval` facility, so a condition can decide a
//! branch but can never execute code.
//!
//! The public contract is [`evaluate`]: it never panics and never
//! returns `Err`; every failure (syntax, security, empty input) is
//! captured into the [`EvalOutcome`] envelope.

mod eval;
mod lexer;
mod parser;

use lexer::{Lexer, TokenKind};
use parser::Parser;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier names that are rejected outright. The grammar cannot
/// express code execution, so this is a defense check against
/// malformed or malicious input, not a grammar production.
const UNSAFE_IDENTIFIERS: &[&str] = &[
    "eval",
    "Function",
    "constructor",
    "__proto__",
    "require",
    "import",
    "process",
    "global",
    "globalThis",
];

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("expression is empty")]
    Empty,
    #[error("unterminated string literal at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unexpected token {token} at offset {offset}")]
    UnexpectedToken { token: String, offset: usize },
    #[error("unmatched parenthesis at offset {offset}")]
    UnmatchedParen { offset: usize },
    #[error("unsafe identifier '{name}' is not allowed")]
    UnsafeIdentifier { name: String },
    #[error("unsafe function call '{name}(...)' is not allowed")]
    UnsafeCall { name: String },
}

/// Result envelope for one evaluation. `result` is only meaningful when
/// `success` is true; `error` is only set when it is false.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub success: bool,
    pub result: bool,
    pub error: Option<String>,
}

impl EvalOutcome {
    fn ok(result: bool) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    fn err(error: ExprError) -> Self {
        Self {
            success: false,
            result: false,
            error: Some(error.to_string()),
        }
    }
}

/// Evaluate a boolean condition expression against a variable context.
///
/// The final value is coerced to a boolean with JavaScript-style
/// truthiness (empty string, `0`, `null`, missing variables and `false`
/// are falsy; everything else is truthy).
pub fn evaluate(expression: &str, context: &Map<String, Value>) -> EvalOutcome {
    if expression.trim().is_empty() {
        return EvalOutcome::err(ExprError::Empty);
    }

    let tokens = match Lexer::new(expression).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => return EvalOutcome::err(e),
    };

    if let Err(e) = check_safety(&tokens) {
        warn!(expression, error = %e, "rejected unsafe condition expression");
        return EvalOutcome::err(e);
    }

    let expr = match Parser::new(tokens).parse() {
        Ok(expr) => expr,
        Err(e) => return EvalOutcome::err(e),
    };

    let result = eval::truthy(&eval::eval(&expr, context));
    debug!(expression, result, "evaluated condition expression");
    EvalOutcome::ok(result)
}

/// Reject denylisted identifiers and any identifier immediately followed
/// by `(`. The grammar has no call syntax, so `name(...)` can only be
/// an attempted function call.
fn check_safety(tokens: &[lexer::Token]) -> Result<(), ExprError> {
    for (i, token) in tokens.iter().enumerate() {
        if let TokenKind::Ident(name) = &token.kind {
            if UNSAFE_IDENTIFIERS.contains(&name.as_str()) {
                return Err(ExprError::UnsafeIdentifier { name: name.clone() });
            }
            if matches!(tokens.get(i + 1), Some(t) if t.kind == TokenKind::LParen) {
                return Err(ExprError::UnsafeCall { name: name.clone() });
            }
        }
    }
    Ok(())
}
