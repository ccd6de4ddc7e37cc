//! Tokenizer for the condition expression language.
//!
//! Produces a flat token stream for the recursive-descent parser in
//! [`super::parser`]. Tokens are ephemeral: they live only for the
//! duration of one `evaluate` call.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Bool(bool),
    Number(f64),
    Str(String),
    Ident(String),
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    EqEqEq,
    BangEq,
    BangEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    LParen,
    RParen,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset of the token's start in the source string.
    pub offset: usize,
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        self.pos += 1;
        ch
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.current(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        self.skip_whitespace();
        let offset = self.pos;
        let ch = match self.advance() {
            Some(c) => c,
            None => {
                return Ok(Token {
                    kind: TokenKind::Eof,
                    offset,
                })
            }
        };

        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '.' => TokenKind::Dot,
            '&' => {
                if self.current() == Some('&') {
                    self.pos += 1;
                    TokenKind::AndAnd
                } else {
                    return Err(ExprError::UnexpectedChar { ch, offset });
                }
            }
            '|' => {
                if self.current() == Some('|') {
                    self.pos += 1;
                    TokenKind::OrOr
                } else {
                    return Err(ExprError::UnexpectedChar { ch, offset });
                }
            }
            '=' => {
                if self.current() == Some('=') {
                    self.pos += 1;
                    if self.current() == Some('=') {
                        self.pos += 1;
                        TokenKind::EqEqEq
                    } else {
                        TokenKind::EqEq
                    }
                } else {
                    return Err(ExprError::UnexpectedChar { ch, offset });
                }
            }
            '!' => {
                if self.current() == Some('=') {
                    self.pos += 1;
                    if self.current() == Some('=') {
                        self.pos += 1;
                        TokenKind::BangEqEq
                    } else {
                        TokenKind::BangEq
                    }
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.current() == Some('=') {
                    self.pos += 1;
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.current() == Some('=') {
                    self.pos += 1;
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '"' | '\'' => self.lex_string(ch, offset)?,
            c if c.is_ascii_digit() => self.lex_number(offset),
            c if c.is_alphabetic() || c == '_' || c == '$' => self.lex_ident_or_keyword(),
            _ => return Err(ExprError::UnexpectedChar { ch, offset }),
        };

        Ok(Token { kind, offset })
    }

    fn lex_string(&mut self, quote: char, offset: usize) -> Result<TokenKind, ExprError> {
        let mut text = String::new();
        loop {
            match self.advance() {
                Some(c) if c == quote => return Ok(TokenKind::Str(text)),
                Some('\\') => {
                    // Minimal escape support: the escaped character stands for itself,
                    // with \n and \t mapped to their control characters.
                    match self.advance() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some(c) => text.push(c),
                        None => return Err(ExprError::UnterminatedString { offset }),
                    }
                }
                Some(c) => text.push(c),
                None => return Err(ExprError::UnterminatedString { offset }),
            }
        }
    }

    fn lex_number(&mut self, offset: usize) -> TokenKind {
        // First digit already consumed.
        let start = offset;
        while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.current() == Some('.') && matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        // Digits and at most one dot always parse.
        TokenKind::Number(text.parse().unwrap_or(0.0))
    }

    fn lex_ident_or_keyword(&mut self) -> TokenKind {
        let start = self.pos - 1;
        while matches!(self.current(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        match text.as_str() {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            _ => TokenKind::Ident(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            kinds("a && b || !c"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::AndAnd,
                TokenKind::Ident("b".into()),
                TokenKind::OrOr,
                TokenKind::Bang,
                TokenKind::Ident("c".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("1.5 >= 2"),
            vec![
                TokenKind::Number(1.5),
                TokenKind::Ge,
                TokenKind::Number(2.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_equality_variants() {
        assert_eq!(
            kinds("a == b === c != d !== e"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::EqEq,
                TokenKind::Ident("b".into()),
                TokenKind::EqEqEq,
                TokenKind::Ident("c".into()),
                TokenKind::BangEq,
                TokenKind::Ident("d".into()),
                TokenKind::BangEqEq,
                TokenKind::Ident("e".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_both_quotes() {
        assert_eq!(
            kinds(r#""hello" 'world'"#),
            vec![
                TokenKind::Str("hello".into()),
                TokenKind::Str("world".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("\"abc").tokenize().unwrap_err();
        assert!(matches!(err, ExprError::UnterminatedString { .. }));
    }

    #[test]
    fn test_unexpected_char() {
        let err = Lexer::new("a # b").tokenize().unwrap_err();
        assert!(matches!(err, ExprError::UnexpectedChar { ch: '#', .. }));
    }

    #[test]
    fn test_single_amp_rejected() {
        assert!(Lexer::new("a & b").tokenize().is_err());
    }
}
