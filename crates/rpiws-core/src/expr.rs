//! Sandboxed transform equations.
//!
//! Equations are arithmetic over a single free variable `x`:
//! `+ - * / // % **`, unary sign, parentheses and numeric literals.
//! Integers stay integers until `/`; floor division and modulo round toward
//! negative infinity. Nothing else is accepted: no names besides `x` and no
//! calls.

use serde_json::{Number, Value};
use std::fmt;
use thiserror::Error;

pub const MAX_EQUATION_LEN: usize = 256;
pub const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("equation longer than 256 bytes")]
    TooLong,
    #[error("equation nested deeper than 32 levels")]
    TooDeep,
    #[error("unexpected character {ch:?} at {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unknown name {0:?}; only `x` is allowed")]
    UnknownName(String),
    #[error("invalid number literal {0:?}")]
    BadNumber(String),
    #[error("unexpected end of equation")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("value {0} is not numeric")]
    NonNumeric(Value),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }

    fn from_value(value: &Value) -> Result<Self, ExprError> {
        match value {
            Value::Bool(b) => Ok(Num::Int(i64::from(*b))),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Num::Int(i))
                } else {
                    n.as_f64()
                        .map(Num::Float)
                        .ok_or_else(|| ExprError::NonNumeric(value.clone()))
                }
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(Num::Int(i))
                } else {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(Num::Float)
                        .ok_or_else(|| ExprError::NonNumeric(value.clone()))
                }
            }
            _ => Err(ExprError::NonNumeric(value.clone())),
        }
    }

    fn into_value(self) -> Result<Value, ExprError> {
        match self {
            Num::Int(v) => Ok(Value::from(v)),
            Num::Float(v) => Number::from_f64(v)
                .map(Value::Number)
                .ok_or(ExprError::NonFinite),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }

    fn eval(self, lhs: Num, rhs: Num) -> Result<Num, ExprError> {
        use Num::{Float, Int};
        let out = match (self, lhs, rhs) {
            (BinOp::Add, Int(a), Int(b)) => a.checked_add(b).map(Int),
            (BinOp::Sub, Int(a), Int(b)) => a.checked_sub(b).map(Int),
            (BinOp::Mul, Int(a), Int(b)) => a.checked_mul(b).map(Int),
            (BinOp::FloorDiv, Int(_), Int(0)) | (BinOp::Mod, Int(_), Int(0)) => {
                return Err(ExprError::DivisionByZero)
            }
            (BinOp::FloorDiv, Int(a), Int(b)) => a.checked_div(b).map(|q| {
                if a % b != 0 && ((a < 0) != (b < 0)) {
                    Int(q - 1)
                } else {
                    Int(q)
                }
            }),
            (BinOp::Mod, Int(a), Int(b)) => a.checked_rem(b).map(|r| {
                if r != 0 && ((r < 0) != (b < 0)) {
                    Int(r + b)
                } else {
                    Int(r)
                }
            }),
            (BinOp::Pow, Int(a), Int(b)) if b >= 0 => u32::try_from(b)
                .ok()
                .and_then(|exp| a.checked_pow(exp))
                .map(Int),
            _ => None,
        };
        if let Some(out) = out {
            return Ok(out);
        }

        let (a, b) = (lhs.as_f64(), rhs.as_f64());
        let value = match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
                return Err(ExprError::DivisionByZero)
            }
            BinOp::Div => a / b,
            BinOp::FloorDiv => (a / b).floor(),
            BinOp::Mod => a - b * (a / b).floor(),
            BinOp::Pow => {
                if a == 0.0 && b < 0.0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.powf(b)
            }
        };
        if value.is_finite() {
            Ok(Float(value))
        } else {
            Err(ExprError::NonFinite)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Lit(Num),
    Var,
    Neg(Box<Node>),
    Bin(BinOp, Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, x: Num) -> Result<Num, ExprError> {
        match self {
            Node::Lit(n) => Ok(*n),
            Node::Var => Ok(x),
            Node::Neg(inner) => match inner.eval(x)? {
                Num::Int(v) => Ok(v.checked_neg().map(Num::Int).unwrap_or(Num::Float(-(v as f64)))),
                Num::Float(v) => Ok(Num::Float(-v)),
            },
            Node::Bin(op, lhs, rhs) => op.eval(lhs.eval(x)?, rhs.eval(x)?),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Num),
    X,
    Op(BinOp),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(Num::Int(v)) => write!(f, "{v}"),
            Token::Num(Num::Float(v)) => write!(f, "{v}"),
            Token::X => f.write_str("x"),
            Token::Op(op) => f.write_str(op.symbol()),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b' ' | b'\t' => pos += 1,
            b'(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            b'+' => {
                tokens.push(Token::Op(BinOp::Add));
                pos += 1;
            }
            b'-' => {
                tokens.push(Token::Op(BinOp::Sub));
                pos += 1;
            }
            b'%' => {
                tokens.push(Token::Op(BinOp::Mod));
                pos += 1;
            }
            b'*' if bytes.get(pos + 1) == Some(&b'*') => {
                tokens.push(Token::Op(BinOp::Pow));
                pos += 2;
            }
            b'*' => {
                tokens.push(Token::Op(BinOp::Mul));
                pos += 1;
            }
            b'/' if bytes.get(pos + 1) == Some(&b'/') => {
                tokens.push(Token::Op(BinOp::FloorDiv));
                pos += 2;
            }
            b'/' => {
                tokens.push(Token::Op(BinOp::Div));
                pos += 1;
            }
            b'0'..=b'9' | b'.' => {
                let start = pos;
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                if pos < bytes.len() && matches!(bytes[pos], b'e' | b'E') {
                    let mut end = pos + 1;
                    if end < bytes.len() && matches!(bytes[end], b'+' | b'-') {
                        end += 1;
                    }
                    if end < bytes.len() && bytes[end].is_ascii_digit() {
                        while end < bytes.len() && bytes[end].is_ascii_digit() {
                            end += 1;
                        }
                        pos = end;
                    }
                }
                let literal = &src[start..pos];
                let num = if literal.contains(['.', 'e', 'E']) {
                    literal.parse::<f64>().ok().map(Num::Float)
                } else {
                    literal.parse::<i64>().ok().map(Num::Int)
                };
                tokens.push(Token::Num(
                    num.ok_or_else(|| ExprError::BadNumber(literal.to_string()))?,
                ));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = pos;
                while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                    pos += 1;
                }
                let name = &src[start..pos];
                if name != "x" {
                    return Err(ExprError::UnknownName(name.to_string()));
                }
                tokens.push(Token::X);
            }
            _ => {
                let ch = src[pos..].chars().next().unwrap_or('\0');
                return Err(ExprError::UnexpectedChar { ch, pos });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod))) =
            self.peek().cloned()
        {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // `-x**2` is `-(x**2)` and `2**-1` is legal.
    fn unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(Node::Neg(Box::new(inner)))
            }
            Some(Token::Op(BinOp::Add)) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(inner)
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Node, ExprError> {
        let base = self.atom()?;
        if let Some(Token::Op(BinOp::Pow)) = self.peek() {
            self.pos += 1;
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Bin(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node, ExprError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Node::Lit(n)),
            Some(Token::X) => Ok(Node::Var),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExprError::UnexpectedToken(other.to_string())),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExprError::UnexpectedToken(other.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// A compiled transform. The empty equation is the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    source: String,
    root: Option<Node>,
}

impl Equation {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        if source.len() > MAX_EQUATION_LEN {
            return Err(ExprError::TooLong);
        }
        if source.trim().is_empty() {
            return Ok(Self::identity());
        }
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(ExprError::UnexpectedToken(extra.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            root: Some(root),
        })
    }

    pub fn identity() -> Self {
        Self {
            source: String::new(),
            root: None,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_identity(&self) -> bool {
        self.root.is_none()
    }

    /// Evaluates with `x = value`. `null` passes through untouched so an
    /// absent channel stays absent after transformation.
    pub fn apply(&self, value: &Value) -> Result<Value, ExprError> {
        let Some(root) = &self.root else {
            return Ok(value.clone());
        };
        if value.is_null() {
            return Ok(Value::Null);
        }
        root.eval(Num::from_value(value)?)?.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, x: Value) -> Result<Value, ExprError> {
        Equation::parse(src)?.apply(&x)
    }

    #[test]
    fn empty_equation_is_identity() {
        let eq = Equation::parse("  ").unwrap();
        assert!(eq.is_identity());
        assert_eq!(eq.apply(&json!("raw")).unwrap(), json!("raw"));
        assert_eq!(eq.apply(&json!(true)).unwrap(), json!(true));
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(eval("x*2", json!(21)).unwrap(), json!(42));
        assert_eq!(eval("x+1", json!(41)).unwrap(), json!(42));
        assert_eq!(eval("(x - 2) * (x + 2)", json!(3)).unwrap(), json!(5));
        assert_eq!(eval("2**10", json!(0)).unwrap(), json!(1024));
    }

    #[test]
    fn true_division_produces_floats() {
        assert_eq!(eval("x/2", json!(3)).unwrap(), json!(1.5));
        assert_eq!(eval("x/1000", json!(23125)).unwrap(), json!(23.125));
        assert_eq!(eval("2**-1", json!(0)).unwrap(), json!(0.5));
    }

    #[test]
    fn floor_division_and_modulo_round_down() {
        assert_eq!(eval("x//2", json!(-7)).unwrap(), json!(-4));
        assert_eq!(eval("x%3", json!(-7)).unwrap(), json!(2));
        assert_eq!(eval("x%-3", json!(7)).unwrap(), json!(-2));
        assert_eq!(eval("x//2.0", json!(7)).unwrap(), json!(3.0));
    }

    #[test]
    fn power_binds_tighter_than_sign() {
        assert_eq!(eval("-x**2", json!(3)).unwrap(), json!(-9));
        assert_eq!(eval("2**3**2", json!(0)).unwrap(), json!(512));
        assert_eq!(eval("1 + 2 * 3", json!(0)).unwrap(), json!(7));
    }

    #[test]
    fn inputs_are_coerced() {
        assert_eq!(eval("x*10", json!(true)).unwrap(), json!(10));
        assert_eq!(eval("x/1000", json!("21500")).unwrap(), json!(21.5));
        assert_eq!(eval("x*2", Value::Null).unwrap(), Value::Null);
        assert!(matches!(eval("x*2", json!("warm")), Err(ExprError::NonNumeric(_))));
    }

    #[test]
    fn rejects_anything_but_arithmetic() {
        assert!(matches!(Equation::parse("__import__('os')"), Err(ExprError::UnknownName(_))));
        assert!(matches!(Equation::parse("x(1)"), Err(ExprError::UnexpectedToken(_))));
        assert!(matches!(Equation::parse("x.real"), Err(ExprError::BadNumber(_))));
        assert!(matches!(Equation::parse("x ; 1"), Err(ExprError::UnexpectedChar { .. })));
        assert!(matches!(Equation::parse("(x + 1"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(Equation::parse("x 1"), Err(ExprError::UnexpectedToken(_))));
    }

    #[test]
    fn bounds_length_and_nesting() {
        let long = "x+".repeat(200) + "x";
        assert_eq!(Equation::parse(&long), Err(ExprError::TooLong));
        let deep = format!("{}x{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(Equation::parse(&deep), Err(ExprError::TooDeep));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(eval("x/0", json!(1)), Err(ExprError::DivisionByZero));
        assert_eq!(eval("x//0", json!(1)), Err(ExprError::DivisionByZero));
        assert_eq!(eval("x%0.0", json!(1)), Err(ExprError::DivisionByZero));
    }
}
