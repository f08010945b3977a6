// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution wrapper.
//!
//! [`execute`] runs one handler invocation and turns every outcome into a
//! [`ResultEnvelope`]. It never fails: authentication failures, handler errors
//! and handler panics all become rejections, so the agent always has an
//! outcome to persist for a claimed job.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::warn;

/// Error raised by a handler or authenticator.
///
/// Serialized as `{name, message, ...details}`. The stack is only included
/// when set explicitly with [`FunctionError::with_stack`].
///
/// Any [`std::error::Error`] converts into a `FunctionError`, so handlers can
/// use `?` on library errors. The type itself does not implement `Error` for
/// that reason.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub details: Map<String, Value>,
}

impl FunctionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            details: Map::new(),
        }
    }

    /// Attach an extra field to the serialized error.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The job targets a function this agent does not serve.
    pub fn not_registered(function: &str) -> Self {
        Self::new(
            "FunctionNotRegistered",
            format!("function '{}' is not registered", function),
        )
        .with_detail("function", function)
    }

    /// The job arguments are not a JSON object.
    pub fn invalid_argument_shape(found: &str) -> Self {
        Self::new(
            "InvalidArgumentShape",
            format!("function arguments must be an object, got {}", found),
        )
        .with_detail("found", found)
    }

    /// The job arguments could not be decoded.
    pub fn malformed_payload(reason: impl Into<String>) -> Self {
        Self::new("MalformedPayload", reason)
    }

    /// The job arguments failed schema validation. Lists every error.
    pub fn schema_validation(errors: Vec<String>) -> Self {
        let message = format!("input failed schema validation: {}", errors.join("; "));
        Self::new("SchemaValidationFailed", message).with_detail(
            "errors",
            Value::Array(errors.into_iter().map(Value::String).collect()),
        )
    }

    /// An authenticator is declared but the job carries no auth context.
    pub fn auth_context_required() -> Self {
        Self::new(
            "AuthContextRequired",
            "function requires an auth context but the job did not provide one",
        )
    }

    pub fn handler_panicked(message: impl Into<String>) -> Self {
        Self::new("HandlerPanicked", message)
    }

    /// Serialized form sent to the control plane.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.details.len() + 3);
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(stack) = &self.stack {
            map.insert("stack".to_string(), Value::String(stack.clone()));
        }
        for (key, value) in &self.details {
            // Core fields win over details with the same key
            if !map.contains_key(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        Value::Object(map)
    }
}

impl std::fmt::Display for FunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Serialize for FunctionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<E: std::error::Error> From<E> for FunctionError {
    fn from(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }
}

/// `my_crate::errors::ParseError<T>` -> `ParseError`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A registered handler: takes the validated input object, returns a value.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, input: Value) -> Result<Value, FunctionError>;
}

#[async_trait]
impl<F, Fut> FunctionHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FunctionError>> + Send + 'static,
{
    async fn call(&self, input: Value) -> Result<Value, FunctionError> {
        (self)(input).await
    }
}

/// Per-call authentication check run before the handler.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, auth_context: &Value, input: &Value) -> Result<(), FunctionError>;
}

#[async_trait]
impl<F, Fut> Authenticator for F
where
    F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FunctionError>> + Send + 'static,
{
    async fn authenticate(&self, auth_context: &Value, input: &Value) -> Result<(), FunctionError> {
        (self)(auth_context.clone(), input.clone()).await
    }
}

/// Outcome kind of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Resolution,
    Rejection,
}

/// Uniform outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope {
    pub result_type: ResultType,
    /// Returned value on resolution, serialized [`FunctionError`] on rejection.
    pub content: Value,
    /// Elapsed handler time in milliseconds.
    pub function_execution_time: u64,
}

impl ResultEnvelope {
    pub fn resolution(content: Value, function_execution_time: u64) -> Self {
        Self {
            result_type: ResultType::Resolution,
            content,
            function_execution_time,
        }
    }

    pub fn rejection(error: FunctionError, function_execution_time: u64) -> Self {
        Self {
            result_type: ResultType::Rejection,
            content: error.to_value(),
            function_execution_time,
        }
    }

    pub fn is_resolution(&self) -> bool {
        self.result_type == ResultType::Resolution
    }

    /// Name of the rejection error, if this is a rejection.
    pub fn error_name(&self) -> Option<&str> {
        match self.result_type {
            ResultType::Rejection => self.content.get("name").and_then(Value::as_str),
            ResultType::Resolution => None,
        }
    }
}

/// Run a handler with optional authentication.
///
/// When `authenticate` is set, it runs first with the job's auth context and
/// the input; a missing auth context is an immediate `AuthContextRequired`
/// rejection and the handler never runs. Execution time covers the handler
/// call (or the failed authentication).
pub async fn execute(
    handler: &dyn FunctionHandler,
    args: Value,
    authenticate: Option<&dyn Authenticator>,
    auth_context: Option<&Value>,
) -> ResultEnvelope {
    if let Some(authenticator) = authenticate {
        let Some(auth_context) = auth_context else {
            return ResultEnvelope::rejection(FunctionError::auth_context_required(), 0);
        };

        let started = Instant::now();
        if let Err(error) = guarded(authenticator.authenticate(auth_context, &args)).await {
            return ResultEnvelope::rejection(error, elapsed_ms(started));
        }
    }

    let started = Instant::now();
    match guarded(handler.call(args)).await {
        Ok(value) => ResultEnvelope::resolution(value, elapsed_ms(started)),
        Err(error) => ResultEnvelope::rejection(error, elapsed_ms(started)),
    }
}

async fn guarded<T>(
    future: impl Future<Output = Result<T, FunctionError>>,
) -> Result<T, FunctionError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "Handler panicked");
            Err(FunctionError::handler_panicked(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
