use std::fmt::{self, Display};
use std::future::ready;

use chatloop_core::tool::{Error as ToolError, Tool, ToolResult};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;

const MAX_DEPTH: usize = 64;

/// Parameters of [`CalculatorTool`].
#[derive(Deserialize, JsonSchema)]
pub struct CalculatorParameters {
    #[schemars(
        description = "Arithmetic expression, e.g. `(2 + 3) * 4 ^ 2` or `max(1, sqrt(2))`."
    )]
    expression: String,
}

/// A tool for evaluating arithmetic expressions.
///
/// Supports `+ - * / % ^` (`**` is accepted for `^`), unary minus,
/// parentheses, the constants `pi` and `e`, and the functions `abs`,
/// `round`, `sqrt`, `pow`, `min` and `max`. Nothing else is evaluated.
pub struct CalculatorTool {
    parameter_schema: Value,
}

impl CalculatorTool {
    /// Creates a new calculator tool.
    #[inline]
    pub fn new() -> Self {
        CalculatorTool {
            parameter_schema: schema_for!(CalculatorParameters).to_value(),
        }
    }
}

impl Default for CalculatorTool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for CalculatorTool {
    type Input = CalculatorParameters;

    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        r#"
Evaluates an arithmetic expression and returns the numeric result.
Supports + - * / % ^, parentheses, pi, e, abs, round, sqrt, pow, min and max."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: CalculatorParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let result = evaluate(&input.expression).map(format_number);
        debug!("evaluated `{}`: {:?}", input.expression, result);
        ready(result)
    }
}

#[inline]
fn fail<S: Into<String>>(reason: S) -> ToolError {
    ToolError::execution_error().with_reason(reason)
}

fn evaluate(expression: &str) -> Result<f64, ToolError> {
    let mut parser = Parser {
        tokens: tokenize(expression)?,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if let Some(token) = parser.peek() {
        return Err(fail(format!("unexpected {token}")));
    }
    if !value.is_finite() {
        return Err(fail("result is not a finite number"));
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    // Avoid printing `-0`.
    let value = if value == 0.0 { 0.0 } else { value };
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(value) => write!(f, "number `{value}`"),
            Token::Ident(name) => write!(f, "`{name}`"),
            Token::Op(op) => write!(f, "`{op}`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::Comma => write!(f, "`,`"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ToolError> {
    let mut tokens = vec![];
    let mut chars = input.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '0'..='9' | '.' => {
                let mut end = start + 1;
                while let Some((idx, _)) =
                    chars.next_if(|&(_, c)| c.is_ascii_digit() || c == '.')
                {
                    end = idx + 1;
                }
                let literal = &input[start..end];
                let value = literal
                    .parse()
                    .map_err(|_| fail(format!("invalid number `{literal}`")))?;
                Token::Number(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some((idx, c)) =
                    chars.next_if(|&(_, c)| c.is_alphanumeric() || c == '_')
                {
                    end = idx + c.len_utf8();
                }
                Token::Ident(input[start..end].to_lowercase())
            }
            '*' => match chars.next_if(|&(_, c)| c == '*') {
                Some(_) => Token::Op('^'),
                None => Token::Op('*'),
            },
            '+' | '-' | '/' | '%' | '^' => Token::Op(c),
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            _ => return Err(fail(format!("unexpected character `{c}`"))),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

/// A recursive descent parser that evaluates while parsing.
///
/// ```text
/// expression := term (('+' | '-') term)*
/// term       := unary (('*' | '/' | '%') unary)*
/// unary      := ('-' | '+') unary | power
/// power      := primary ('^' unary)?
/// primary    := number | ident | ident '(' args ')' | '(' expression ')'
/// ```
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    #[inline]
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, token: &Token) -> Result<(), ToolError> {
        if self.eat(token) {
            return Ok(());
        }
        match self.peek() {
            Some(found) => Err(fail(format!("expected {token}, found {found}"))),
            None => Err(fail(format!("expected {token} at the end"))),
        }
    }

    fn expression(&mut self) -> Result<f64, ToolError> {
        let mut value = self.term()?;
        loop {
            if self.eat(&Token::Op('+')) {
                value += self.term()?;
            } else if self.eat(&Token::Op('-')) {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<f64, ToolError> {
        let mut value = self.unary()?;
        loop {
            if self.eat(&Token::Op('*')) {
                value *= self.unary()?;
            } else if self.eat(&Token::Op('/')) {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err(fail("division by zero"));
                }
                value /= divisor;
            } else if self.eat(&Token::Op('%')) {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err(fail("modulo by zero"));
                }
                value %= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    fn unary(&mut self) -> Result<f64, ToolError> {
        // Every nesting level passes through here.
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(fail("expression is nested too deeply"));
        }

        let value = if self.eat(&Token::Op('-')) {
            -self.unary()?
        } else if self.eat(&Token::Op('+')) {
            self.unary()?
        } else {
            self.power()?
        };

        self.depth -= 1;
        Ok(value)
    }

    fn power(&mut self) -> Result<f64, ToolError> {
        let base = self.primary()?;
        if self.eat(&Token::Op('^')) {
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, ToolError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    call(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(token) => Err(fail(format!("unexpected {token}"))),
            None => Err(fail("unexpected end of expression")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<f64>, ToolError> {
        let mut args = vec![];
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RParen)?;
                return Ok(args);
            }
        }
    }
}

fn constant(name: &str) -> Result<f64, ToolError> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        _ => Err(fail(format!("unknown constant `{name}`"))),
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, ToolError> {
    let value = match (name, args) {
        ("abs", [x]) => x.abs(),
        ("round", [x]) => x.round(),
        ("sqrt", [x]) if *x < 0.0 => {
            return Err(fail("square root of a negative number"));
        }
        ("sqrt", [x]) => x.sqrt(),
        ("pow", [base, exponent]) => base.powf(*exponent),
        ("min", [first, rest @ ..]) => {
            rest.iter().fold(*first, |acc, value| acc.min(*value))
        }
        ("max", [first, rest @ ..]) => {
            rest.iter().fold(*first, |acc, value| acc.max(*value))
        }
        ("abs" | "round" | "sqrt", _) => {
            return Err(fail(format!("`{name}` takes exactly one argument")));
        }
        ("pow", _) => {
            return Err(fail("`pow` takes exactly two arguments"));
        }
        ("min" | "max", _) => {
            return Err(fail(format!("`{name}` takes at least one argument")));
        }
        _ => return Err(fail(format!("unknown function `{name}`"))),
    };
    Ok(value)
}
