//! Operation Results
//!
//! Every step and every operation call ends in a [`FlowResult`]: an
//! immutable record tagged as success, failure or exception.
//!
//! # Tags
//!
//! Results carry an ordered, de-duplicated list of symbolic ids. They are
//! routing labels for the `on_*` hooks and never affect flow control:
//!
//! ```
//! use opflow::operation::FlowResult;
//! use serde_json::json;
//!
//! let mut emails = 0;
//! FlowResult::ok(json!({"sent": true}))
//!     .with_ids(["email"])
//!     .on_success(&["email"], |_| emails += 1)
//!     .on_failure(&[], |_| unreachable!());
//! assert_eq!(emails, 1);
//! ```

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

/// Error type returned by step handlers for unexpected failures.
pub type StepError = Box<dyn Error + Send + Sync>;

/// Tag attached to exception results built from step errors.
pub const ERROR_ID: &str = "error";

/// Tag attached to [`FlowResult::void`].
pub const VOID_ID: &str = "void";

/// Source of process-unique instance numbers for [`OperationRef`].
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// The three possible outcomes of a step or operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Ok,
    Failure,
    Exception,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failure => "failure",
            Self::Exception => "exception",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the operation instance that produced a result.
///
/// Each call of an operation gets a fresh instance number, so results from
/// two different calls never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationRef {
    name: Arc<str>,
    instance: u64,
}

impl OperationRef {
    /// Allocates a new instance of the named operation.
    pub(crate) fn next(name: &Arc<str>) -> Self {
        Self {
            name: Arc::clone(name),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.instance)
    }
}

/// A runtime error captured from a step, shared between results and
/// error handlers.
///
/// Two exceptions are equal only when they wrap the very same error object.
#[derive(Clone)]
pub struct StepException(Arc<dyn Error + Send + Sync>);

impl StepException {
    /// Returns the wrapped error.
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Attempts to view the wrapped error as a concrete type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl From<StepError> for StepException {
    fn from(error: StepError) -> Self {
        Self(Arc::from(error))
    }
}

impl PartialEq for StepException {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl fmt::Debug for StepException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StepException").field(&self.0).finish()
    }
}

impl fmt::Display for StepException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for StepException {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

/// The value carried by a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Value(Value),
    Exception(StepException),
}

impl Payload {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Exception(_) => None,
        }
    }

    pub fn as_exception(&self) -> Option<&StepException> {
        match self {
            Self::Exception(exception) => Some(exception),
            Self::Value(_) => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<StepException> for Payload {
    fn from(exception: StepException) -> Self {
        Self::Exception(exception)
    }
}

/// Partial update applied by [`FlowResult::mutate`].
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    pub operation: Option<OperationRef>,
    pub kind: Option<ResultKind>,
    pub value: Option<Payload>,
    pub ids: Option<Vec<String>>,
}

/// Immutable outcome of a step or an operation call.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowResult {
    operation: Option<OperationRef>,
    kind: ResultKind,
    value: Payload,
    ids: Vec<String>,
}

impl FlowResult {
    fn new(kind: ResultKind, value: Payload, ids: Vec<String>) -> Self {
        Self {
            operation: None,
            kind,
            value,
            ids: dedup_ids(ids),
        }
    }

    /// Successful result with no tags.
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::new(ResultKind::Ok, Payload::Value(value.into()), Vec::new())
    }

    /// Domain failure with no tags.
    pub fn failure(value: impl Into<Value>) -> Self {
        Self::new(ResultKind::Failure, Payload::Value(value.into()), Vec::new())
    }

    /// Exception result tagged `error`.
    pub fn exception(exception: impl Into<StepException>) -> Self {
        Self::new(
            ResultKind::Exception,
            Payload::Exception(exception.into()),
            vec![ERROR_ID.to_string()],
        )
    }

    /// Successful result without a value, tagged `void`.
    pub fn void() -> Self {
        Self::new(ResultKind::Ok, Payload::Value(Value::Null), vec![VOID_ID.to_string()])
    }

    /// Returns a copy of this result with its tags replaced.
    pub fn with_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: dedup_ids(ids.into_iter().map(Into::into).collect()),
            ..self
        }
    }

    /// Returns a new result with the given fields replaced.
    pub fn mutate(&self, mutation: Mutation) -> Self {
        Self {
            operation: mutation.operation.or_else(|| self.operation.clone()),
            kind: mutation.kind.unwrap_or(self.kind),
            value: mutation.value.unwrap_or_else(|| self.value.clone()),
            ids: mutation
                .ids
                .map(dedup_ids)
                .unwrap_or_else(|| self.ids.clone()),
        }
    }

    pub fn operation(&self) -> Option<&OperationRef> {
        self.operation.as_ref()
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.value
    }

    /// The JSON value, or `None` for exception results.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_value()
    }

    /// The captured error, or `None` for value results.
    pub fn exception_value(&self) -> Option<&StepException> {
        self.value.as_exception()
    }

    pub fn into_payload(self) -> Payload {
        self.value
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResultKind::Ok
    }

    pub fn is_failure(&self) -> bool {
        self.kind == ResultKind::Failure
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Exception
    }

    /// True when `filter` is empty or shares at least one id with this result.
    pub fn matches_ids(&self, filter: &[&str]) -> bool {
        filter.is_empty() || filter.iter().any(|id| self.ids.iter().any(|own| own == id))
    }

    /// Calls `handler` when this is a success matching `filter`.
    pub fn on_success<F>(&self, filter: &[&str], handler: F) -> &Self
    where
        F: FnOnce(&FlowResult),
    {
        self.dispatch(ResultKind::Ok, filter, handler)
    }

    /// Calls `handler` when this is a failure matching `filter`.
    pub fn on_failure<F>(&self, filter: &[&str], handler: F) -> &Self
    where
        F: FnOnce(&FlowResult),
    {
        self.dispatch(ResultKind::Failure, filter, handler)
    }

    /// Calls `handler` when this is an exception matching `filter`.
    pub fn on_error<F>(&self, filter: &[&str], handler: F) -> &Self
    where
        F: FnOnce(&FlowResult),
    {
        self.dispatch(ResultKind::Exception, filter, handler)
    }

    fn dispatch<F>(&self, kind: ResultKind, filter: &[&str], handler: F) -> &Self
    where
        F: FnOnce(&FlowResult),
    {
        if self.kind == kind && self.matches_ids(filter) {
            handler(self);
        }
        self
    }

    /// Renders the result as JSON for logs and command-line output.
    pub fn to_json(&self) -> Value {
        let value = match &self.value {
            Payload::Value(value) => value.clone(),
            Payload::Exception(exception) => Value::String(exception.to_string()),
        };

        json!({
            "operation": self.operation.as_ref().map(|op| op.to_string()),
            "type": self.kind,
            "value": value,
            "ids": self.ids,
        })
    }
}

/// Removes repeated ids, keeping the first occurrence.
pub(crate) fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}
