//! Caller contexts and their classification.
//!
//! The guard never names a concrete transport: HTTP frameworks implement
//! [`InboundRequest`], message consumers implement [`MessageEnvelope`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::token::OperationParams;

/// An inbound synchronous request (headers plus query/form parameters).
pub trait InboundRequest: Send + Sync {
    fn header(&self, name: &str) -> Option<String>;

    fn param(&self, name: &str) -> Option<String>;
}

/// Headers of an inbound asynchronous message.
pub trait MessageEnvelope: Send + Sync {
    fn header(&self, name: &str) -> Option<String>;
}

/// Raw broker record headers.
impl MessageEnvelope for BTreeMap<String, Vec<u8>> {
    fn header(&self, name: &str) -> Option<String> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .and_then(|v| String::from_utf8(v.clone()).ok())
    }
}

impl MessageEnvelope for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<String> {
        self.get(name).cloned().or_else(|| {
            self.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        })
    }
}

/// How the caller consumes the guard's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    /// Request/response: failures are returned to the caller.
    Synchronous,
    /// Message consumer: failures must not trigger endless redelivery.
    Asynchronous,
}

impl CallerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerKind::Synchronous => "sync",
            CallerKind::Asynchronous => "async",
        }
    }
}

impl fmt::Display for CallerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call of a guarded operation together with everything a token can be resolved from.
#[derive(Clone)]
pub struct Invocation<'a> {
    operation: String,
    params: OperationParams,
    request: Option<&'a dyn InboundRequest>,
    message: Option<&'a dyn MessageEnvelope>,
}

impl<'a> Invocation<'a> {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: OperationParams::default(),
            request: None,
            message: None,
        }
    }

    pub fn with_params(mut self, params: OperationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_request(mut self, request: &'a dyn InboundRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_message(mut self, message: &'a dyn MessageEnvelope) -> Self {
        self.message = Some(message);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn params(&self) -> &OperationParams {
        &self.params
    }

    pub fn request(&self) -> Option<&'a dyn InboundRequest> {
        self.request
    }

    pub fn message(&self) -> Option<&'a dyn MessageEnvelope> {
        self.message
    }

    /// Synchronous exactly when a request context is present; a message consumer
    /// is recognised by its absence.
    pub fn kind(&self) -> CallerKind {
        classify(self.request.is_some())
    }
}

impl fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("operation", &self.operation)
            .field("params", &self.params)
            .field("has_request", &self.request.is_some())
            .field("has_message", &self.message.is_some())
            .finish()
    }
}

pub fn classify(has_request_context: bool) -> CallerKind {
    if has_request_context {
        CallerKind::Synchronous
    } else {
        CallerKind::Asynchronous
    }
}
