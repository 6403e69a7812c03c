//! Token resolution.
//!
//! Sources are probed in a fixed order and the first non-blank value wins:
//! the per-call [`TokenExpression`], the request header, the request parameter
//! (only when allowed), and finally the message header.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::context::Invocation;
use super::mode::IdempotentOptions;
use crate::error::{IdempotencyError, Result};

/// Named parameters of a guarded operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationParams(Map<String, Value>);

impl OperationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds parameters from any value that serializes to a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(IdempotencyError::Validation(format!(
                "operation parameters must serialize to an object, got {}",
                kind_of(&other)
            ))),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Looks up a dot-separated path such as `order.id`. Array elements are addressed by index.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Renders a scalar parameter as token text. Null, empty and composite values yield nothing.
fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_blank(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

type Evaluator = dyn Fn(&OperationParams) -> Option<String> + Send + Sync;

/// A compiled per-call rule deriving a token from the operation's own parameters.
#[derive(Clone)]
pub struct TokenExpression {
    source: String,
    eval: Arc<Evaluator>,
}

impl TokenExpression {
    /// The value at a dot-separated parameter path, e.g. `order.id`.
    pub fn field(path: impl Into<String>) -> Self {
        let path = path.into();
        let lookup = path.clone();
        Self {
            source: format!("field({})", path),
            eval: Arc::new(move |params| params.lookup(&lookup).and_then(render_scalar)),
        }
    }

    /// SHA-256 over the listed parameters. Yields nothing if any of them is missing.
    pub fn digest<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let source = format!("digest({})", fields.join(","));
        Self {
            source,
            eval: Arc::new(move |params| {
                let mut hasher = Sha256::new();
                for field in &fields {
                    let value = params.lookup(field)?;
                    hasher.update(field.as_bytes());
                    hasher.update(b"=");
                    hasher.update(value.to_string().as_bytes());
                    hasher.update(b"|");
                }
                Some(hex::encode(hasher.finalize()))
            }),
        }
    }

    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&OperationParams) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            source: description.into(),
            eval: Arc::new(f),
        }
    }

    pub fn evaluate(&self, params: &OperationParams) -> Option<String> {
        (self.eval)(params).and_then(non_blank)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for TokenExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenExpression").field(&self.source).finish()
    }
}

/// Resolves the idempotency token for an invocation, or `None` when no source yields one.
pub fn resolve_token(options: &IdempotentOptions, invocation: &Invocation<'_>) -> Option<String> {
    if let Some(expression) = &options.token_expression {
        if let Some(token) = expression.evaluate(invocation.params()) {
            return Some(token);
        }
        tracing::debug!(
            expression = expression.source(),
            operation = invocation.operation(),
            "Token expression yielded no value"
        );
    }

    if let Some(request) = invocation.request() {
        if let Some(token) = request.header(&options.header_name).and_then(non_blank) {
            return Some(token);
        }
        if options.allow_param {
            if let Some(token) = request.param(&options.param_name).and_then(non_blank) {
                return Some(token);
            }
        }
    }

    invocation
        .message()
        .and_then(|message| message.header(&options.header_name))
        .and_then(non_blank)
}
