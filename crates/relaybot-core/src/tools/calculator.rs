//! Calculator tool: a small arithmetic evaluator.
//!
//! Grammar:
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/') unary)*
//! unary := ('+' | '-') unary | power
//! power := atom ('**' unary)?
//! atom  := number | constant | func '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Nothing is ever handed to an interpreter; identifiers outside the fixed
//! function and constant set are rejected.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

use super::{ParamType, Tool, ToolError, ToolParameter};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Perform mathematical calculations. Supports basic operations (+, -, *, /) and advanced functions (sqrt, pow, sin, cos, etc.)"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required(
            "expression",
            ParamType::String,
            "Mathematical expression to evaluate (e.g., '2 + 2', 'sqrt(16)', 'pow(2, 3)')",
        )]
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<Value, ToolError> {
        let raw = match args.get("expression") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ToolError::InvalidArguments("'expression' must be a string".into())),
        };

        let expression = sanitize(&raw);
        Ok(match evaluate(&expression) {
            Ok(result) => json!({ "success": true, "result": number_value(result), "expression": expression }),
            Err(error) => json!({ "success": false, "error": error, "expression": expression }),
        })
    }
}

/// Strip anything resembling an import, a dunder access, or exec.
fn sanitize(expression: &str) -> String {
    static FORBIDDEN: OnceLock<Regex> = OnceLock::new();
    FORBIDDEN
        .get_or_init(|| Regex::new(r"__|import|exec").expect("forbidden token pattern should compile"))
        .replace_all(expression, "")
        .into_owned()
}

/// Whole results are reported as integers (`2+2` gives `4`, not `4.0`).
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// Longest expression accepted, in characters.
const MAX_EXPRESSION_LEN: usize = 1_000;

/// Deepest nesting of parentheses, calls, signs and exponents.
const MAX_DEPTH: usize = 64;

/// Evaluate an arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(format!("expression too long (max {} characters)", MAX_EXPRESSION_LEN));
    }
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(tok) = parser.peek() {
        return Err(format!("unexpected token {}", tok));
    }
    if value.is_nan() {
        return Err("math domain error".into());
    }
    if value.is_infinite() {
        return Err("math range error".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Pow,
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "'{}'", n),
            Self::Ident(s) => write!(f, "'{}'", s),
            Self::Plus => f.write_str("'+'"),
            Self::Minus => f.write_str("'-'"),
            Self::Star => f.write_str("'*'"),
            Self::Slash => f.write_str("'/'"),
            Self::Pow => f.write_str("'**'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::Comma => f.write_str("','"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Scientific notation, only when digits follow the exponent marker.
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
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            _ => {
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    other => return Err(format!("invalid character '{}'", other)),
                });
                i += 1;
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

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(format!("expected {} but found {}", expected, tok)),
            None => Err(format!("expected {} at end of expression", expected)),
        }
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        return Err("division by zero".into());
                    }
                    value /= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    // Every recursive path (parentheses, call arguments, signs, exponents)
    // passes through here, so this is where nesting is bounded.
    fn unary(&mut self) -> Result<f64, String> {
        if self.depth >= MAX_DEPTH {
            return Err("expression nested too deeply".into());
        }
        self.depth += 1;
        let value = match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.unary().map(|v| -v)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        };
        self.depth -= 1;
        value
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Pow) {
            self.pos += 1;
            let exponent = self.unary()?;
            return checked_pow(base, exponent);
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, String> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.arguments()?;
                    call(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(tok) => Err(format!("unexpected token {}", tok)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn arguments(&mut self) -> Result<Vec<f64>, String> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(tok) => return Err(format!("expected ',' or ')' but found {}", tok)),
                None => return Err("unclosed function call".into()),
            }
        }
    }
}

fn constant(name: &str) -> Result<f64, String> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        _ => Err(format!("name '{}' is not defined", name)),
    }
}

fn checked_pow(base: f64, exponent: f64) -> Result<f64, String> {
    if base == 0.0 && exponent < 0.0 {
        return Err("division by zero".into());
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err("math domain error".into());
    }
    Ok(base.powf(exponent))
}

fn arity(name: &str, args: &[f64], allowed: std::ops::RangeInclusive<usize>) -> Result<(), String> {
    if allowed.contains(&args.len()) {
        return Ok(());
    }
    let expected = if allowed.start() == allowed.end() {
        allowed.start().to_string()
    } else {
        format!("{} to {}", allowed.start(), allowed.end())
    };
    Err(format!("{}() takes {} argument(s), {} given", name, expected, args.len()))
}

fn call(name: &str, args: &[f64]) -> Result<f64, String> {
    match name {
        "sqrt" => {
            arity(name, args, 1..=1)?;
            if args[0] < 0.0 {
                return Err("math domain error".into());
            }
            Ok(args[0].sqrt())
        }
        "pow" => {
            arity(name, args, 2..=2)?;
            checked_pow(args[0], args[1])
        }
        "sin" => {
            arity(name, args, 1..=1)?;
            Ok(args[0].sin())
        }
        "cos" => {
            arity(name, args, 1..=1)?;
            Ok(args[0].cos())
        }
        "tan" => {
            arity(name, args, 1..=1)?;
            Ok(args[0].tan())
        }
        "log" => {
            arity(name, args, 1..=2)?;
            if args[0] <= 0.0 {
                return Err("math domain error".into());
            }
            match args.get(1) {
                None => Ok(args[0].ln()),
                Some(&base) if base <= 0.0 || base == 1.0 => Err("math domain error".into()),
                Some(&base) => Ok(args[0].ln() / base.ln()),
            }
        }
        "abs" => {
            arity(name, args, 1..=1)?;
            Ok(args[0].abs())
        }
        "round" => {
            arity(name, args, 1..=2)?;
            let digits = args.get(1).copied().unwrap_or(0.0);
            if digits.fract() != 0.0 {
                return Err("round() digits must be an integer".into());
            }
            let factor = 10f64.powi(digits as i32);
            Ok((args[0] * factor).round() / factor)
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(format!("{}() expected at least 1 argument, got 0", name));
            }
            let pick = if name == "min" { f64::min } else { f64::max };
            Ok(args[1..].iter().fold(args[0], |acc, &x| pick(acc, x)))
        }
        _ => Err(format!("name '{}' is not defined", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(expression: &str) -> Value {
        let mut args = HashMap::new();
        args.insert("expression".to_string(), json!(expression));
        CalculatorTool.execute(args).await.unwrap()
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("-2 ** 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ** 3 ** 2").unwrap(), 512.0);
        assert_eq!(evaluate("10 / 4").unwrap(), 2.5);
        assert_eq!(evaluate("1.5e2 + 1").unwrap(), 151.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(evaluate("sqrt(16)").unwrap(), 4.0);
        assert_eq!(evaluate("pow(2, 3)").unwrap(), 8.0);
        assert_eq!(evaluate("max(1, 7, 3) - min(4, 2)").unwrap(), 5.0);
        assert_eq!(evaluate("round(3.14159, 2)").unwrap(), 3.14);
        assert_eq!(evaluate("abs(-5)").unwrap(), 5.0);
        assert!((evaluate("log(e)").unwrap() - 1.0).abs() < 1e-12);
        assert!((evaluate("log(8, 2)").unwrap() - 3.0).abs() < 1e-12);
        assert!((evaluate("cos(pi)").unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_domain_errors() {
        assert_eq!(evaluate("10/0").unwrap_err(), "division by zero");
        assert_eq!(evaluate("sqrt(-1)").unwrap_err(), "math domain error");
        assert_eq!(evaluate("log(0)").unwrap_err(), "math domain error");
        assert!(evaluate("foo(1)").unwrap_err().contains("not defined"));
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1").is_err());
        assert!(evaluate("").is_err());
    }

    #[test]
    fn test_dangerous_tokens_are_stripped() {
        assert_eq!(sanitize("__import__('os')"), "('os')");
        assert_eq!(sanitize("exec(1)"), "(1)");
        assert!(evaluate(&sanitize("__import__('os').system('ls')")).is_err());
    }

    #[tokio::test]
    async fn test_whole_results_are_integers() {
        let value = run("2+2").await;
        assert_eq!(value, json!({"success": true, "result": 4, "expression": "2+2"}));
        assert_eq!(run("10/4").await["result"], json!(2.5));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let shallow = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(evaluate(&shallow).unwrap(), 1.0);

        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&deep).unwrap_err(), "expression nested too deeply");
        assert_eq!(evaluate(&format!("{}1", "-".repeat(100))).unwrap_err(), "expression nested too deeply");
        assert_eq!(evaluate(&format!("{}1)", "sqrt(".repeat(100))).unwrap_err(), "expression nested too deeply");
        assert!(evaluate(&"2**".repeat(100)).is_err());
    }

    #[tokio::test]
    async fn test_hostile_expressions_fail_cleanly() {
        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let value = run(&parens).await;
        assert_eq!(value["success"], false);
        assert!(value["error"].as_str().unwrap().contains("too long"));

        let signs = format!("{}1", "-".repeat(200_000));
        assert_eq!(run(&signs).await["success"], false);
    }

    #[tokio::test]
    async fn test_division_by_zero_is_reported_not_raised() {
        let value = run("10/0").await;
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "division by zero");
        assert_eq!(value["expression"], "10/0");
    }
}
