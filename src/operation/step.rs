//! Flow Steps
//!
//! A flow is an ordered list of [`Step`]s. A step is either a named handler
//! or a group: a dispatcher that wraps a nested list of steps and decides
//! when (and whether) to run them through a [`Continuation`].
//!
//! ```
//! use opflow::operation::Step;
//!
//! let flow = vec![
//!     Step::named("add1"),
//!     Step::group("in_transaction", ["add2", "add3"]),
//!     Step::named("add4"),
//! ];
//! assert_eq!(flow[1].name(), "in_transaction");
//! ```

use std::sync::Arc;

use serde_json::Value;

use super::attributes::Attributes;
use super::definition::Context;
use super::result::{FlowResult, StepError};
use crate::execution::Continuation;

/// One entry of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Invoke the step handler registered under this name.
    Named(String),
    /// Invoke the group dispatcher registered under this name with the nested steps.
    Group(String, Vec<Step>),
}

impl Step {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn group<I, S>(name: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Step>,
    {
        Self::Group(name.into(), steps.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) | Self::Group(name, _) => name,
        }
    }

    /// Finds a step by name in this step or its nested steps.
    pub fn find(&self, name: &str) -> Option<&Step> {
        if self.name() == name {
            return Some(self);
        }
        match self {
            Self::Named(_) => None,
            Self::Group(_, nested) => nested.iter().find_map(|step| step.find(name)),
        }
    }

    /// Calls `visit` for this step and every nested step, depth first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Step)) {
        visit(self);
        if let Self::Group(_, nested) = self {
            for step in nested {
                step.walk(visit);
            }
        }
    }
}

impl From<&str> for Step {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for Step {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// Raw return value of a step, before the wrap policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Result(FlowResult),
    Raw(Value),
}

impl From<FlowResult> for StepOutput {
    fn from(result: FlowResult) -> Self {
        Self::Result(result)
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        Self::Raw(value)
    }
}

impl From<bool> for StepOutput {
    fn from(value: bool) -> Self {
        Self::Raw(Value::Bool(value))
    }
}

impl From<Option<Value>> for StepOutput {
    fn from(value: Option<Value>) -> Self {
        Self::Raw(value.unwrap_or(Value::Null))
    }
}

/// What a step handler returns.
pub type StepReturn = Result<StepOutput, StepError>;

pub(crate) type StepHandler = Arc<dyn Fn(&Context, &Attributes) -> StepReturn + Send + Sync>;

pub(crate) type GroupHandler =
    Arc<dyn Fn(&Context, &Attributes, Continuation<'_>) -> Result<(), StepError> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    Step(StepHandler),
    Group(GroupHandler),
}

/// A registered handler together with the attributes it requires.
#[derive(Clone)]
pub(crate) struct StepDefinition {
    pub(crate) required: Vec<String>,
    pub(crate) handler: Handler,
}

impl StepDefinition {
    pub(crate) fn is_group(&self) -> bool {
        matches!(self.handler, Handler::Group(_))
    }
}
