//! Boolean conditions guarding template actions.
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | compare
//! compare := primary (("==" | "!=") primary)?
//! primary := "(" expr ")" | "defined(" name ")" | ${name} | 'text' | "text" | word
//! ```
//!
//! Operands are strings. A bare operand is true unless it is empty, `false` or `0`.

use std::fmt;

use crate::context::ExecutionContext;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(String),
    Literal(String),
    Defined(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for ConditionError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Literal(String),
    Word(String),
    Eq,
    Ne,
    Not,
    And,
    Or,
    LParen,
    RParen,
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError {
                position: *offset,
                message: format!("unexpected {:?}", token),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        truthy(&eval(&self.expr, ctx))
    }

    /// Variables whose values the condition reads. `defined(...)` arguments are not
    /// included since they may legitimately be absent.
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_refs(&self.expr, &mut out);
        out
    }
}

fn collect_refs(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Var(name) => out.push(name.clone()),
        Expr::Literal(_) | Expr::Defined(_) => {}
        Expr::Not(inner) => collect_refs(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}

fn truthy(value: &str) -> bool {
    !matches!(value, "" | "false" | "0")
}

fn bool_str(b: bool) -> String {
    let s = if b { "true" } else { "false" };
    s.to_string()
}

fn eval(expr: &Expr, ctx: &ExecutionContext) -> String {
    match expr {
        Expr::Var(name) => ctx.get(name).unwrap_or_default().to_string(),
        Expr::Literal(value) => value.clone(),
        Expr::Defined(name) => bool_str(ctx.contains(name)),
        Expr::Not(inner) => bool_str(!truthy(&eval(inner, ctx))),
        Expr::And(a, b) => bool_str(truthy(&eval(a, ctx)) && truthy(&eval(b, ctx))),
        Expr::Or(a, b) => bool_str(truthy(&eval(a, ctx)) || truthy(&eval(b, ctx))),
        Expr::Eq(a, b) => bool_str(eval(a, ctx) == eval(b, ctx)),
        Expr::Ne(a, b) => bool_str(eval(a, ctx) != eval(b, ctx)),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |position: usize, message: &str| ConditionError {
        position,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Ne));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Not));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 2;
            }
            '$' if next == Some('{') => {
                let start = i + 2;
                let mut end = start;
                while end < chars.len() && chars[end].1 != '}' {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(err(offset, "unterminated ${"));
                }
                let name: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                if name.is_empty() || !name.chars().all(is_name_char) {
                    return Err(err(offset, "invalid variable name"));
                }
                tokens.push((offset, Token::Var(name)));
                i = end + 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].1 != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(err(offset, "unterminated string"));
                }
                let text: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Literal(text)));
                i = end + 1;
            }
            c if is_name_char(c) || c == '-' => {
                let start = i;
                while i < chars.len() && (is_name_char(chars[i].1) || chars[i].1 == '-') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Word(word)));
            }
            _ => return Err(err(offset, &format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(ConditionError {
                position: offset,
                message: format!("expected {:?}, found {:?}", expected, other),
            }),
        }
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.primary()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.advance();
                Ok(Expr::Eq(Box::new(left), Box::new(self.primary()?)))
            }
            Some(Token::Ne) => {
                self.advance();
                Ok(Expr::Ne(Box::new(left), Box::new(self.primary()?)))
            }
            _ => Ok(left),
        }
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Word(word)) if word == "defined" && self.peek() == Some(&Token::LParen) => {
                self.advance();
                let offset = self.offset();
                let name = match self.advance() {
                    Some(Token::Word(name)) | Some(Token::Var(name)) => name,
                    other => {
                        return Err(ConditionError {
                            position: offset,
                            message: format!("defined() expects a name, found {:?}", other),
                        })
                    }
                };
                self.expect(Token::RParen)?;
                Ok(Expr::Defined(name))
            }
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(Token::Literal(text)) | Some(Token::Word(text)) => Ok(Expr::Literal(text)),
            other => Err(ConditionError {
                position: offset,
                message: format!("expected an operand, found {:?}", other),
            }),
        }
    }
}
