pub mod adapter;
pub mod sandbox;

use adapter::ExecutionAdapter;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What the scheduler hands a runtime for one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub task_id: String,
    pub code: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
    Denied,
}

/// What a runtime reports back. `duration_ms` is measured by the scheduler;
/// runtimes only classify the outcome.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub result: Option<Value>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed(result: Option<Value>) -> Self {
        Self {
            status: RunStatus::Completed,
            result,
            exit_code: Some(0),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            result: None,
            exit_code: Some(1),
            error: Some(error.into()),
        }
    }
}

/// A sandboxed code runner. Implementations isolate the code; the control
/// plane only sees tool calls (through the adapter) and the final outcome.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn id(&self) -> &str;
    fn label(&self) -> &str;
    async fn run(&self, spec: RunSpec, adapter: Arc<dyn ExecutionAdapter>) -> Result<RunOutcome>;
}

/// Known runtimes by id.
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn Runtime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            runtimes: HashMap::new(),
        }
    }

    pub fn register(&mut self, runtime: Arc<dyn Runtime>) {
        self.runtimes.insert(runtime.id().to_string(), runtime);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Runtime>> {
        self.runtimes.get(id).cloned()
    }

    /// `(id, label)` pairs for `/api/runtime-targets`, sorted by id.
    pub fn targets(&self) -> Vec<(String, String)> {
        let mut targets: Vec<(String, String)> = self
            .runtimes
            .values()
            .map(|r| (r.id().to_string(), r.label().to_string()))
            .collect();
        targets.sort();
        targets
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-process dev runtime: no isolation, no tool calls. It understands a
/// trailing `return <literal-or-arithmetic>` statement, which is enough for
/// smoke tests and local development; real code belongs in a sandbox.
pub struct LocalEchoRuntime;

#[async_trait]
impl Runtime for LocalEchoRuntime {
    fn id(&self) -> &str {
        "local"
    }

    fn label(&self) -> &str {
        "In-process echo runtime (dev only)"
    }

    async fn run(&self, spec: RunSpec, _adapter: Arc<dyn ExecutionAdapter>) -> Result<RunOutcome> {
        let Some(expr) = spec
            .code
            .lines()
            .rev()
            .map(str::trim)
            .find_map(|line| line.strip_prefix("return "))
        else {
            return Ok(RunOutcome::completed(None));
        };
        let expr = expr.trim().trim_end_matches(';');
        if let Ok(value) = serde_json::from_str::<Value>(expr) {
            return Ok(RunOutcome::completed(Some(value)));
        }
        match eval_arithmetic(expr) {
            Some(n) => Ok(RunOutcome::completed(Some(Value::from(n)))),
            None => Ok(RunOutcome::failed(format!(
                "local runtime cannot evaluate: {}",
                expr
            ))),
        }
    }
}

/// Integer arithmetic over `+ - * /` and parentheses. Returns `None` on
/// anything else.
fn eval_arithmetic(expr: &str) -> Option<i64> {
    let tokens = tokenize(expr)?;
    let (value, rest) = parse_sum(&tokens)?;
    rest.is_empty().then_some(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(i64),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {}
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            d if d.is_ascii_digit() => {
                let mut n = i64::from(d.to_digit(10)?);
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                    n = n.checked_mul(10)?.checked_add(i64::from(d))?;
                    chars.next();
                }
                tokens.push(Token::Number(n));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

fn parse_sum(tokens: &[Token]) -> Option<(i64, &[Token])> {
    let (mut value, mut rest) = parse_product(tokens)?;
    loop {
        match rest.first() {
            Some(Token::Plus) => {
                let (rhs, next) = parse_product(&rest[1..])?;
                value = value.checked_add(rhs)?;
                rest = next;
            }
            Some(Token::Minus) => {
                let (rhs, next) = parse_product(&rest[1..])?;
                value = value.checked_sub(rhs)?;
                rest = next;
            }
            _ => return Some((value, rest)),
        }
    }
}

fn parse_product(tokens: &[Token]) -> Option<(i64, &[Token])> {
    let (mut value, mut rest) = parse_atom(tokens)?;
    loop {
        match rest.first() {
            Some(Token::Star) => {
                let (rhs, next) = parse_atom(&rest[1..])?;
                value = value.checked_mul(rhs)?;
                rest = next;
            }
            Some(Token::Slash) => {
                let (rhs, next) = parse_atom(&rest[1..])?;
                if rhs == 0 {
                    return None;
                }
                value = value.checked_div(rhs)?;
                rest = next;
            }
            _ => return Some((value, rest)),
        }
    }
}

fn parse_atom(tokens: &[Token]) -> Option<(i64, &[Token])> {
    match tokens.first()? {
        Token::Number(n) => Some((*n, &tokens[1..])),
        Token::Minus => {
            let (value, rest) = parse_atom(&tokens[1..])?;
            Some((value.checked_neg()?, rest))
        }
        Token::Open => {
            let (value, rest) = parse_sum(&tokens[1..])?;
            match rest.first() {
                Some(Token::Close) => Some((value, &rest[1..])),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests;
