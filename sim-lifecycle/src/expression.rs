//! Restricted arithmetic evaluator
//!
//! Resolves the deferred values found in simulation templates: bare literals,
//! macro-decorated references (`${name}`, `$(expr)`) and small arithmetic
//! formulas over the variable environment. Only arithmetic is supported, there
//! is no general-purpose scripting here.

use crate::types::{LifecycleError, Number, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of the internal alias used by the template's macro syntax
pub const ALIAS_PREFIX: &str = "v_";

/// Mapping of variable name to numeric value
///
/// Every write goes through [`VariableEnvironment::set`], which keeps the plain
/// name and its `v_` alias in sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableEnvironment {
    values: BTreeMap<String, Number>,
}

impl VariableEnvironment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value under both its plain name and its `v_` alias
    pub fn set(&mut self, name: &str, value: Number) {
        self.values.insert(name.to_string(), value);
        self.values.insert(format!("{}{}", ALIAS_PREFIX, name), value);
    }

    /// Look up a value by plain or aliased name
    pub fn get(&self, name: &str) -> Option<Number> {
        self.values.get(name).copied()
    }

    /// Check whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of bindings (aliases included)
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all bindings in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Number)> {
        self.values.iter()
    }
}

/// Evaluate an expression against the environment
///
/// A bare non-negative literal is returned as-is. Anything else has its macro
/// decoration stripped, `^` normalized to `**`, and is evaluated as arithmetic.
pub fn evaluate(expr: &str, env: &VariableEnvironment) -> Result<Number> {
    let trimmed = expr.trim().trim_matches(|c| c == '"' || c == '\'');

    if let Some(number) = parse_literal(trimmed) {
        log::trace!("    Evaluand is numeric: {}", trimmed);
        return Ok(number);
    }

    let normalized: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '$' | '{' | '}'))
        .collect::<String>()
        .replace('^', "**");
    log::trace!("    Formula: '{}'", normalized);

    let tokens = tokenize(&normalized)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        env,
        source: &normalized,
    };
    let value = parser.parse_expr()?;
    if parser.pos != tokens.len() {
        return Err(LifecycleError::Evaluation(format!(
            "Unexpected trailing input in '{}'",
            normalized
        )));
    }
    log::trace!("    Evaluated value: {}", value);
    Ok(value)
}

/// Parse a bare non-negative integer or decimal literal
fn parse_literal(s: &str) -> Option<Number> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if s.contains('.') {
        s.parse::<f64>().ok().map(Number::Float)
    } else {
        s.parse::<i64>().ok().map(Number::Int)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Number),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => {
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Scientific notation (1e5, 2.5E-3)
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = if text.contains(['.', 'e', 'E']) {
                    text.parse::<f64>().map(Number::Float).ok()
                } else {
                    text.parse::<i64>().map(Number::Int).ok()
                };
                match number {
                    Some(n) => tokens.push(Token::Num(n)),
                    None => {
                        return Err(LifecycleError::Evaluation(format!(
                            "Invalid number '{}' in '{}'",
                            text, input
                        )))
                    }
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    tokens.push(Token::Pow);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => {
                return Err(LifecycleError::Evaluation(format!(
                    "Unexpected character '{}' in '{}'",
                    other, input
                )))
            }
        }
    }

    Ok(tokens)
}

/// Recursive descent parser with Python-like precedence:
/// `+ -` < `* / %` < unary sign < `**` (right associative)
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    env: &'a VariableEnvironment,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn error(&self, message: &str) -> LifecycleError {
        LifecycleError::Evaluation(format!("{} in '{}'", message, self.source))
    }

    fn parse_expr(&mut self) -> Result<Number> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let rhs = self.parse_term()?;
                    value = self.arith(value, rhs, '+')?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let rhs = self.parse_term()?;
                    value = self.arith(value, rhs, '-')?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn parse_term(&mut self) -> Result<Number> {
        let mut value = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                Some(Token::Percent) => '%',
                _ => return Ok(value),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            value = self.arith(value, rhs, op)?;
        }
    }

    fn parse_unary(&mut self) -> Result<Number> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Ok(match value {
                    Number::Int(v) => Number::Int(-v),
                    Number::Float(v) => Number::Float(-v),
                })
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Number> {
        let base = self.parse_atom()?;
        if let Some(Token::Pow) = self.peek() {
            self.pos += 1;
            let exponent = self.parse_unary()?;
            return Ok(power(base, exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Number> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(self.error("Missing closing parenthesis")),
                }
            }
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let args = self.parse_args()?;
                    return self.call(&name, &args);
                }
                self.env
                    .get(&name)
                    .ok_or(LifecycleError::UndefinedVariable(name))
            }
            Some(_) => Err(self.error("Unexpected token")),
            None => Err(self.error("Unexpected end of expression")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Number>> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(self.error("Malformed argument list")),
            }
        }
    }

    fn call(&self, name: &str, args: &[Number]) -> Result<Number> {
        let unary = |f: fn(f64) -> f64| -> Result<Number> {
            match args {
                [x] => Ok(Number::Float(f(x.as_f64()))),
                _ => Err(self.error(&format!("Function '{}' takes one argument", name))),
            }
        };
        match name {
            "abs" => match args {
                [Number::Int(v)] => Ok(Number::Int(v.abs())),
                _ => unary(f64::abs),
            },
            "sqrt" => unary(f64::sqrt),
            "exp" => unary(f64::exp),
            "ln" | "log" => unary(f64::ln),
            "floor" | "ceil" | "round" => {
                let f: fn(f64) -> f64 = match name {
                    "floor" => f64::floor,
                    "ceil" => f64::ceil,
                    _ => f64::round,
                };
                match args {
                    [x] => Ok(Number::Int(f(x.as_f64()) as i64)),
                    _ => Err(self.error(&format!("Function '{}' takes one argument", name))),
                }
            }
            "min" | "max" if !args.is_empty() => {
                let mut best = args[0];
                for candidate in &args[1..] {
                    let better = if name == "min" {
                        candidate.as_f64() < best.as_f64()
                    } else {
                        candidate.as_f64() > best.as_f64()
                    };
                    if better {
                        best = *candidate;
                    }
                }
                Ok(best)
            }
            _ => Err(self.error(&format!("Unknown function '{}'", name))),
        }
    }

    fn arith(&self, lhs: Number, rhs: Number, op: char) -> Result<Number> {
        match (lhs, rhs, op) {
            (_, _, '/') => {
                if rhs.is_zero() {
                    return Err(self.error("Division by zero"));
                }
                Ok(Number::Float(lhs.as_f64() / rhs.as_f64()))
            }
            (Number::Int(a), Number::Int(b), _) => {
                let result = match op {
                    '+' => a.checked_add(b),
                    '-' => a.checked_sub(b),
                    '*' => a.checked_mul(b),
                    '%' => {
                        if b == 0 {
                            return Err(self.error("Modulo by zero"));
                        }
                        // Sign follows the divisor
                        Some(((a % b) + b) % b)
                    }
                    _ => None,
                };
                result
                    .map(Number::Int)
                    .ok_or_else(|| self.error("Integer overflow"))
            }
            _ => {
                let (a, b) = (lhs.as_f64(), rhs.as_f64());
                let result = match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '%' => {
                        if b == 0.0 {
                            return Err(self.error("Modulo by zero"));
                        }
                        a - b * (a / b).floor()
                    }
                    _ => return Err(self.error("Unknown operator")),
                };
                Ok(Number::Float(result))
            }
        }
    }
}

fn power(base: Number, exponent: Number) -> Number {
    if let (Number::Int(b), Number::Int(e)) = (base, exponent) {
        if let Ok(e) = u32::try_from(e) {
            if let Some(v) = b.checked_pow(e) {
                return Number::Int(v);
            }
        }
    }
    Number::Float(base.as_f64().powf(exponent.as_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> VariableEnvironment {
        let mut env = VariableEnvironment::new();
        env.set("steps", Number::Int(1000));
        env.set("dt", Number::Float(0.005));
        env
    }

    #[test]
    fn test_environment_aliases() {
        let env = env();
        assert_eq!(env.get("steps"), Some(Number::Int(1000)));
        assert_eq!(env.get("v_steps"), Some(Number::Int(1000)));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_literals() {
        assert_eq!(evaluate("1500", &env()).unwrap(), Number::Int(1500));
        assert_eq!(evaluate("0.25", &env()).unwrap(), Number::Float(0.25));
    }

    #[test]
    fn test_macro_decoration() {
        assert_eq!(evaluate("${steps}", &env()).unwrap(), Number::Int(1000));
        assert_eq!(evaluate("$(v_steps*2)", &env()).unwrap(), Number::Int(2000));
        assert_eq!(evaluate("\"${steps}/4\"", &env()).unwrap(), Number::Float(250.0));
    }

    #[test]
    fn test_precedence_and_power() {
        assert_eq!(evaluate("2+3*4", &env()).unwrap(), Number::Int(14));
        assert_eq!(evaluate("(2+3)*4", &env()).unwrap(), Number::Int(20));
        assert_eq!(evaluate("2^10", &env()).unwrap(), Number::Int(1024));
        assert_eq!(evaluate("2**3**2", &env()).unwrap(), Number::Int(512));
        assert_eq!(evaluate("-2**2", &env()).unwrap(), Number::Int(-4));
        assert_eq!(evaluate("7%3", &env()).unwrap(), Number::Int(1));
        assert_eq!(evaluate("1e3*2", &env()).unwrap(), Number::Float(2000.0));
    }

    #[test]
    fn test_functions() {
        assert_eq!(evaluate("floor(steps/3)", &env()).unwrap(), Number::Int(333));
        assert_eq!(evaluate("max(1, steps, 20)", &env()).unwrap(), Number::Int(1000));
        assert_eq!(evaluate("sqrt(16)", &env()).unwrap(), Number::Float(4.0));
    }

    #[test]
    fn test_undefined_variable() {
        let err = evaluate("${missing}*2", &env()).unwrap_err();
        assert!(matches!(err, LifecycleError::UndefinedVariable(ref name) if name == "missing"));
    }

    #[test]
    fn test_malformed_expression() {
        assert!(matches!(
            evaluate("steps*", &env()).unwrap_err(),
            LifecycleError::Evaluation(_)
        ));
        assert!(matches!(
            evaluate("(steps", &env()).unwrap_err(),
            LifecycleError::Evaluation(_)
        ));
        assert!(matches!(
            evaluate("steps/0", &env()).unwrap_err(),
            LifecycleError::Evaluation(_)
        ));
        assert!(matches!(
            evaluate("steps # 2", &env()).unwrap_err(),
            LifecycleError::Evaluation(_)
        ));
    }
}
