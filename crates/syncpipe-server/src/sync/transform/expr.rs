//! Restricted expression language for custom transform and validation rules
//!
//! Expressions are parsed into a tagged AST up front. They can read fields
//! of the current record, use literals, arithmetic, comparisons, boolean
//! logic and a fixed whitelist of pure functions. There is no assignment,
//! no I/O and no way to name anything outside the record.
//!
//! ```text
//! if(amount > 100, upper(trim(name)), coalesce(nickname, name))
//! ```

use std::cmp::Ordering;
use syncpipe_common::{DataRecord, FieldType, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct ExprError(pub String);

fn err<T>(msg: impl Into<String>) -> Result<T, ExprError> {
    Err(ExprError(msg.into()))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Ident(String),
    String(String),
    Number(String),
    True,
    False,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

/// Whitelisted functions
#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Trim,
    Lower,
    Upper,
    Len,
    Concat,
    Coalesce,
    Round,
    Abs,
    If,
    Substr,
    Replace,
    ToString,
    ToInt,
    ToFloat,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "trim" => Function::Trim,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "len" => Function::Len,
            "concat" => Function::Concat,
            "coalesce" => Function::Coalesce,
            "round" => Function::Round,
            "abs" => Function::Abs,
            "if" => Function::If,
            "substr" => Function::Substr,
            "replace" => Function::Replace,
            "to_string" => Function::ToString,
            "to_int" => Function::ToInt,
            "to_float" => Function::ToFloat,
            _ => return None,
        })
    }

    /// Allowed argument count, `(min, max)`
    fn arity(self) -> (usize, usize) {
        match self {
            Function::Trim | Function::Lower | Function::Upper | Function::Len | Function::Abs => (1, 1),
            Function::ToString | Function::ToInt | Function::ToFloat => (1, 1),
            Function::Round => (1, 2),
            Function::Substr => (2, 3),
            Function::If | Function::Replace => (3, 3),
            Function::Concat | Function::Coalesce => (1, usize::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// A parsed, ready-to-evaluate expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser::new(tokens);
        let root = parser.parse_expr()?;
        if !parser.is_done() {
            return err("unexpected trailing tokens");
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a record; missing fields read as null
    pub fn evaluate(&self, record: &DataRecord) -> Result<Value, ExprError> {
        eval_expr(&self.root, record)
    }

    /// Evaluate and require a boolean (null counts as false)
    pub fn evaluate_bool(&self, record: &DataRecord) -> Result<bool, ExprError> {
        truthy(&self.evaluate(record)?)
    }
}

fn truthy(value: &Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => err(format!("expected a boolean, got {}", other.to_text())),
    }
}

fn eval_expr(expr: &Expr, record: &DataRecord) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(name) => Ok(record.value_or_null(name)),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&eval_expr(inner, record)?)?)),
        Expr::Unary(UnaryOp::Neg, inner) => match eval_expr(inner, record)? {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| ExprError("integer overflow".to_string())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => err(format!("cannot negate {}", other.to_text())),
        },
        Expr::Binary(BinaryOp::And, left, right) => {
            if !truthy(&eval_expr(left, record)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval_expr(right, record)?)?))
        },
        Expr::Binary(BinaryOp::Or, left, right) => {
            if truthy(&eval_expr(left, record)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval_expr(right, record)?)?))
        },
        Expr::Binary(op, left, right) => {
            let lhs = eval_expr(left, record)?;
            let rhs = eval_expr(right, record)?;
            eval_binary(*op, lhs, rhs)
        },
        Expr::Call(Function::If, args) => {
            if truthy(&eval_expr(&args[0], record)?)? {
                eval_expr(&args[1], record)
            } else {
                eval_expr(&args[2], record)
            }
        },
        Expr::Call(Function::Coalesce, args) => {
            for arg in args {
                let value = eval_expr(arg, record)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        },
        Expr::Call(function, args) => {
            let values = args
                .iter()
                .map(|arg| eval_expr(arg, record))
                .collect::<Result<Vec<_>, _>>()?;
            eval_call(*function, values)
        },
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            _ => None,
        };
        if op != BinaryOp::Div {
            return result.map(Value::Int).ok_or_else(|| ExprError("integer overflow".to_string()));
        }
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return err(format!("arithmetic on non-numeric values {} and {}", lhs.to_text(), rhs.to_text()));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => {
            if b == 0.0 {
                return err("division by zero");
            }
            a / b
        },
    };
    Ok(Value::Float(result))
}

fn eval_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            if lhs.is_null() || rhs.is_null() {
                return Ok(Value::Null);
            }
            if op == BinaryOp::Add && (matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_))) {
                return Ok(Value::String(format!("{}{}", lhs.to_text(), rhs.to_text())));
            }
            arithmetic(op, &lhs, &rhs)
        },
        BinaryOp::Eq => Ok(Value::Bool(lhs.compare(&rhs) == Some(Ordering::Equal))),
        BinaryOp::Ne => Ok(Value::Bool(lhs.compare(&rhs) != Some(Ordering::Equal))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if lhs.is_null() || rhs.is_null() {
                return Ok(Value::Bool(false));
            }
            let ordering = lhs
                .compare(&rhs)
                .ok_or_else(|| ExprError(format!("cannot compare {} with {}", lhs.to_text(), rhs.to_text())))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        },
        BinaryOp::And | BinaryOp::Or => err("logical operators are evaluated lazily"),
    }
}

fn string_arg(value: &Value, function: &str) -> Result<Option<String>, ExprError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => err(format!("{}() expects a string, got {}", function, other.to_text())),
    }
}

fn int_arg(value: &Value, function: &str) -> Result<i64, ExprError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => err(format!("{}() expects an integer, got {}", function, other.to_text())),
    }
}

fn eval_call(function: Function, args: Vec<Value>) -> Result<Value, ExprError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match function {
        Function::Trim => Ok(string_arg(&arg(0), "trim")?.map_or(Value::Null, |s| Value::String(s.trim().to_string()))),
        Function::Lower => Ok(string_arg(&arg(0), "lower")?.map_or(Value::Null, |s| Value::String(s.to_lowercase()))),
        Function::Upper => Ok(string_arg(&arg(0), "upper")?.map_or(Value::Null, |s| Value::String(s.to_uppercase()))),
        Function::Len => match arg(0) {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::Json(serde_json::Value::Array(items)) => Ok(Value::Int(items.len() as i64)),
            other => err(format!("len() expects a string or array, got {}", other.to_text())),
        },
        Function::Concat => Ok(Value::String(args.iter().map(Value::to_text).collect())),
        Function::Round => {
            let digits = match args.get(1) {
                Some(v) => int_arg(v, "round")?,
                None => 0,
            };
            match arg(0) {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(Value::Int(i)),
                Value::Float(f) => Ok(Value::Float(round_to(f, digits))),
                other => err(format!("round() expects a number, got {}", other.to_text())),
            }
        },
        Function::Abs => match arg(0) {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| ExprError("integer overflow".to_string())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => err(format!("abs() expects a number, got {}", other.to_text())),
        },
        Function::Substr => {
            let Some(s) = string_arg(&arg(0), "substr")? else {
                return Ok(Value::Null);
            };
            let start = usize::try_from(int_arg(&arg(1), "substr")?.max(0)).unwrap_or(0);
            let chars = s.chars().skip(start);
            let out: String = match args.get(2) {
                Some(len) => chars.take(usize::try_from(int_arg(len, "substr")?.max(0)).unwrap_or(0)).collect(),
                None => chars.collect(),
            };
            Ok(Value::String(out))
        },
        Function::Replace => {
            let Some(s) = string_arg(&arg(0), "replace")? else {
                return Ok(Value::Null);
            };
            let from = string_arg(&arg(1), "replace")?.unwrap_or_default();
            let to = string_arg(&arg(2), "replace")?.unwrap_or_default();
            if from.is_empty() {
                return Ok(Value::String(s));
            }
            Ok(Value::String(s.replace(&from, &to)))
        },
        Function::ToString => Ok(match arg(0) {
            Value::Null => Value::Null,
            other => Value::String(other.to_text()),
        }),
        Function::ToInt => arg(0).coerce(FieldType::Int, None).map_err(|e| ExprError(e.to_string())),
        Function::ToFloat => arg(0).coerce(FieldType::Float, None).map_err(|e| ExprError(e.to_string())),
        Function::If | Function::Coalesce => err("lazy function evaluated eagerly"),
    }
}

pub(crate) fn round_to(value: f64, digits: i64) -> f64 {
    let factor = 10f64.powi(digits.clamp(-15, 15) as i32);
    (value * factor).round() / factor
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, index: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_and()?;
        while self.match_token(&Token::OrOr) {
            let rhs = self.parse_and()?;
            expr = Expr::Binary(BinaryOp::Or, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_comparison()?;
        while self.match_token(&Token::AndAnd) {
            let rhs = self.parse_comparison()?;
            expr = Expr::Binary(BinaryOp::And, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_additive()?;
        let op = match self.tokens.get(self.index) {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(expr),
        };
        self.index += 1;
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(expr), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = if self.match_token(&Token::Plus) {
                BinaryOp::Add
            } else if self.match_token(&Token::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let rhs = self.parse_multiplicative()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = if self.match_token(&Token::Star) {
                BinaryOp::Mul
            } else if self.match_token(&Token::Slash) {
                BinaryOp::Div
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.match_token(&Token::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.match_token(&Token::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next_token() {
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect_token(&Token::RParen)?;
                Ok(expr)
            },
            Some(Token::String(value)) => Ok(Expr::Literal(Value::String(value))),
            Some(Token::Number(raw)) => parse_number(&raw).map(Expr::Literal),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.match_token(&Token::LParen) {
                    let function =
                        Function::lookup(&name).ok_or_else(|| ExprError(format!("unknown function '{}'", name)))?;
                    let args = self.parse_args()?;
                    let (min, max) = function.arity();
                    if args.len() < min || args.len() > max {
                        return err(format!("{}() takes {} argument(s), got {}", name, min, args.len()));
                    }
                    Ok(Expr::Call(function, args))
                } else {
                    Ok(Expr::Field(name))
                }
            },
            other => err(format!("unexpected token {:?}", other)),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.match_token(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.match_token(&Token::Comma) {
                continue;
            }
            self.expect_token(&Token::RParen)?;
            break;
        }
        Ok(args)
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.index) == Some(token) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect_token(&mut self, token: &Token) -> Result<(), ExprError> {
        if self.match_token(token) {
            Ok(())
        } else {
            err(format!("expected token {:?}", token))
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn is_done(&self) -> bool {
        self.index >= self.tokens.len()
    }
}

fn parse_number(raw: &str) -> Result<Value, ExprError> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    raw.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| ExprError(format!("invalid number '{}'", raw)))
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut chars = input.chars().peekable();
    let mut tokens = Vec::new();
    while let Some(&ch) = chars.peek() {
        let single = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            _ => None,
        };
        if let Some(token) = single {
            chars.next();
            tokens.push(token);
            continue;
        }

        match ch {
            '=' | '!' | '<' | '>' => {
                chars.next();
                let followed_by_eq = chars.peek() == Some(&'=');
                if followed_by_eq {
                    chars.next();
                }
                tokens.push(match (ch, followed_by_eq) {
                    ('=', true) => Token::EqEq,
                    ('!', true) => Token::NotEq,
                    ('!', false) => Token::Bang,
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    _ => return err("assignment is not supported, use '=='"),
                });
            },
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(ch) {
                    return err(format!("unexpected '{}', use '{}{}'", ch, ch, ch));
                }
                tokens.push(if ch == '&' { Token::AndAnd } else { Token::OrOr });
            },
            '"' | '\'' => tokens.push(Token::String(parse_string(&mut chars)?)),
            ch if ch.is_ascii_whitespace() => {
                chars.next();
            },
            ch if ch.is_ascii_digit() => tokens.push(Token::Number(parse_number_token(&mut chars))),
            ch if is_ident_start(ch) => {
                let ident = parse_ident(&mut chars);
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            },
            other => return err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

fn parse_string<I>(chars: &mut std::iter::Peekable<I>) -> Result<String, ExprError>
where
    I: Iterator<Item = char>,
{
    let quote = chars.next().ok_or_else(|| ExprError("unterminated string".to_string()))?;
    let mut result = String::new();
    while let Some(ch) = chars.next() {
        if ch == quote {
            return Ok(result);
        }
        if ch == '\\' {
            let escaped = chars
                .next()
                .ok_or_else(|| ExprError("unterminated escape sequence".to_string()))?;
            match escaped {
                'n' => result.push('\n'),
                't' => result.push('\t'),
                other => result.push(other),
            }
        } else {
            result.push(ch);
        }
    }
    err("unterminated string")
}

fn parse_number_token<I>(chars: &mut std::iter::Peekable<I>) -> String
where
    I: Iterator<Item = char>,
{
    let mut result = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() || ch == '.' {
            result.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    result
}

fn parse_ident<I>(chars: &mut std::iter::Peekable<I>) -> String
where
    I: Iterator<Item = char>,
{
    let mut result = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            result.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    result
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}
