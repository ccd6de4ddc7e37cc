//! Recursive-descent parser for the condition expression language.
//!
//! Grammar, lowest to highest precedence:
//!
//! ```text
//! orExpr     := andExpr ('||' andExpr)*
//! andExpr    := comparison ('&&' comparison)*
//! comparison := unary ((== | === | != | !== | < | <= | > | >=) unary)?
//! unary      := '!' unary | primary
//! primary    := true | false | number | string
//!             | identifier ('.' identifier)*
//!             | '(' orExpr ')'
//! ```
//!
//! There is deliberately no call syntax, no assignment and no loops:
//! conditions are user-authored data, not programs.

use super::lexer::{Token, TokenKind};
use super::ExprError;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    LooseEq,
    StrictEq,
    LooseNe,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Immutable expression tree, owned by the evaluation call that built it.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Dotted property path into the evaluation context, e.g. `user.plan.name`.
    Identifier(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        // The token stream always ends with Eof, so `pos` never walks past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.current().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        match &self.current().kind {
            TokenKind::Eof => Ok(expr),
            kind => Err(ExprError::UnexpectedToken {
                token: format!("{kind:?}"),
                offset: self.current().offset,
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_unary()?;
        let op = match self.current().kind {
            TokenKind::EqEq => CompareOp::LooseEq,
            TokenKind::EqEqEq => CompareOp::StrictEq,
            TokenKind::BangEq => CompareOp::LooseNe,
            TokenKind::BangEqEq => CompareOp::StrictNe,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Le => CompareOp::Le,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Ge => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            TokenKind::Number(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Ident(first) => {
                let mut path = vec![first];
                while self.eat(&TokenKind::Dot) {
                    match self.advance().kind {
                        TokenKind::Ident(name) => path.push(name),
                        // `a.true` etc. are not valid property accesses here.
                        kind => {
                            return Err(ExprError::UnexpectedToken {
                                token: format!("{kind:?}"),
                                offset: token.offset,
                            })
                        }
                    }
                }
                Ok(Expr::Identifier(path))
            }
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(ExprError::UnmatchedParen {
                        offset: token.offset,
                    });
                }
                Ok(inner)
            }
            kind => Err(ExprError::UnexpectedToken {
                token: format!("{kind:?}"),
                offset: token.offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::Lexer;
    use super::*;

    fn parse(src: &str) -> Result<Expr, ExprError> {
        Parser::new(Lexer::new(src).tokenize()?).parse()
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        // a || b && c  =>  Or(a, And(b, c))
        match parse("a || b && c").unwrap() {
            Expr::Or(left, right) => {
                assert!(matches!(*left, Expr::Identifier(_)));
                assert!(matches!(*right, Expr::And(_, _)));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_parens_override_precedence() {
        // (a || b) && c  =>  And(Or(a, b), c)
        match parse("(a || b) && c").unwrap() {
            Expr::And(left, _) => assert!(matches!(*left, Expr::Or(_, _))),
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_property_path() {
        match parse("user.plan.name == \"pro\"").unwrap() {
            Expr::Compare(CompareOp::LooseEq, left, _) => match *left {
                Expr::Identifier(path) => assert_eq!(path, vec!["user", "plan", "name"]),
                other => panic!("unexpected lhs: {other:?}"),
            },
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_double_negation() {
        match parse("!!ready").unwrap() {
            Expr::Not(inner) => assert!(matches!(*inner, Expr::Not(_))),
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_unmatched_paren() {
        assert!(matches!(
            parse("(a && b").unwrap_err(),
            ExprError::UnmatchedParen { .. }
        ));
    }

    #[test]
    fn test_trailing_garbage() {
        assert!(matches!(
            parse("a b").unwrap_err(),
            ExprError::UnexpectedToken { .. }
        ));
    }

    #[test]
    fn test_dangling_operator() {
        assert!(parse("a &&").is_err());
    }
}
