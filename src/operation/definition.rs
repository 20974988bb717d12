//! Operation Definitions
//!
//! An [`Operation`] is declared once with an [`OperationBuilder`] and can
//! then be called any number of times. Each call creates a fresh
//! [`Context`] (the operation instance) that step handlers use to build
//! their results.
//!
//! # Example
//!
//! ```
//! use opflow::{attrs, Config, Operation, Step};
//! use serde_json::json;
//!
//! let add = Operation::builder("Add")
//!     .attributes(["num"])
//!     .step("add1", &["num"], |ctx, attrs| {
//!         Ok(ctx.success(json!({"num": attrs["num"].as_i64().unwrap_or(0) + 1})))
//!     })
//!     .step("add2", &["num"], |ctx, attrs| {
//!         Ok(ctx.success(json!({"num": attrs["num"].as_i64().unwrap_or(0) + 2})))
//!     })
//!     .flow([Step::named("add1"), Step::named("add2")])
//!     .build()?;
//!
//! let result = add.call_with(&Config::default(), attrs! { "num" => 0 })?;
//! assert!(result.is_success());
//! assert_eq!(result.value(), Some(&json!({"num": 3})));
//! # Ok::<(), opflow::FlowError>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

use super::attributes::{AttributeSchema, Attributes};
use super::result::{FlowResult, Mutation, OperationRef, StepError, VOID_ID};
use super::step::{GroupHandler, Handler, Step, StepDefinition, StepHandler, StepOutput, StepReturn};
use crate::config::{self, Config};
use crate::error::FlowError;
use crate::execution::{dispatch, Continuation, ExecutionTrace, Mode};
use crate::validation::Validator;

/// Step name used by [`OperationBuilder::perform`].
pub const PERFORM_STEP: &str = "call";

/// The operation instance visible to step handlers during one call.
#[derive(Debug, Clone)]
pub struct Context {
    operation: OperationRef,
    attributes: Attributes,
}

impl Context {
    pub(crate) fn new(name: &Arc<str>, attributes: Attributes) -> Self {
        Self {
            operation: OperationRef::next(name),
            attributes,
        }
    }

    pub fn operation(&self) -> &OperationRef {
        &self.operation
    }

    /// Attributes supplied to `call`, before any step ran.
    pub fn initial_attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Stamps `result` as produced by this instance.
    pub fn stamp(&self, result: FlowResult) -> FlowResult {
        result.mutate(Mutation {
            operation: Some(self.operation.clone()),
            ..Default::default()
        })
    }

    pub fn success(&self, value: impl Into<Value>) -> FlowResult {
        self.stamp(FlowResult::ok(value))
    }

    pub fn success_tagged(&self, ids: &[&str], value: impl Into<Value>) -> FlowResult {
        self.stamp(FlowResult::ok(value).with_ids(ids.iter().copied()))
    }

    pub fn failure(&self, value: impl Into<Value>) -> FlowResult {
        self.stamp(FlowResult::failure(value))
    }

    pub fn failure_tagged(&self, ids: &[&str], value: impl Into<Value>) -> FlowResult {
        self.stamp(FlowResult::failure(value).with_ids(ids.iter().copied()))
    }

    /// Success without a value, tagged `void`.
    pub fn void(&self) -> FlowResult {
        self.success_tagged(&[VOID_ID], Value::Null)
    }
}

/// A declared operation: schema, flow and step handlers.
#[derive(Clone)]
pub struct Operation {
    name: Arc<str>,
    schema: AttributeSchema,
    flow: Vec<Step>,
    steps: HashMap<String, StepDefinition>,
    validator: Option<Arc<dyn Validator>>,
}

impl Operation {
    /// Starts declaring a new operation type.
    pub fn builder(name: impl Into<String>) -> OperationBuilder {
        OperationBuilder::new(name)
    }

    /// Starts declaring a subtype that inherits this operation's schema,
    /// flow, handlers and validator.
    ///
    /// The schema is copied: declarations on the new builder do not affect
    /// this operation.
    pub fn extend(&self, name: impl Into<String>) -> OperationBuilder {
        OperationBuilder {
            name: name.into(),
            schema: self.schema.derive(),
            flow: Some(self.flow.clone()),
            steps: self.steps.clone(),
            validator: self.validator.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub fn flow(&self) -> &[Step] {
        &self.flow
    }

    pub fn validator(&self) -> Option<&dyn Validator> {
        self.validator.as_deref()
    }

    /// Attributes the named step or group requires.
    pub fn required_attributes(&self, step: &str) -> &[String] {
        self.steps
            .get(step)
            .map(|definition| definition.required.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn step_handler(&self, name: &str) -> Option<&StepHandler> {
        match self.steps.get(name).map(|definition| &definition.handler) {
            Some(Handler::Step(handler)) => Some(handler),
            _ => None,
        }
    }

    pub(crate) fn group_handler(&self, name: &str) -> Option<&GroupHandler> {
        match self.steps.get(name).map(|definition| &definition.handler) {
            Some(Handler::Group(handler)) => Some(handler),
            _ => None,
        }
    }

    /// Calls the operation using the process-wide configuration.
    pub fn call(&self, attributes: Attributes) -> Result<FlowResult, FlowError> {
        self.call_with(&config::current(), attributes)
    }

    /// Calls the operation with an explicit configuration.
    ///
    /// Domain failures and (outside strict mode) runtime step errors come
    /// back as `Ok` results. `Err` is reserved for schema violations and
    /// strict-mode re-raises.
    pub fn call_with(&self, config: &Config, attributes: Attributes) -> Result<FlowResult, FlowError> {
        dispatch::run(self, config, attributes, Mode::Flow).map(|(result, _)| result)
    }

    /// Like [`call_with`](Self::call_with), also returning the step trace.
    pub fn call_traced(
        &self,
        config: &Config,
        attributes: Attributes,
    ) -> Result<(FlowResult, ExecutionTrace), FlowError> {
        dispatch::run(self, config, attributes, Mode::Flow)
    }

    /// Runs a single step (or group) of the flow in isolation.
    ///
    /// The validation step and the declared-attribute check of `call` are
    /// skipped; transient attributes may be supplied directly.
    pub fn run_step(
        &self,
        config: &Config,
        step: &str,
        attributes: Attributes,
    ) -> Result<FlowResult, FlowError> {
        let target = self
            .flow
            .iter()
            .find_map(|s| s.find(step))
            .cloned()
            .or_else(|| self.step_handler(step).map(|_| Step::named(step)))
            .ok_or_else(|| FlowError::UnknownStep {
                operation: self.name().to_string(),
                step: step.to_string(),
            })?;

        dispatch::run(self, config, attributes, Mode::Single(target)).map(|(result, _)| result)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&String> = self.steps.keys().collect();
        steps.sort();
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("flow", &self.flow)
            .field("steps", &steps)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Declares an [`Operation`].
pub struct OperationBuilder {
    name: String,
    schema: AttributeSchema,
    flow: Option<Vec<Step>>,
    steps: HashMap<String, StepDefinition>,
    validator: Option<Arc<dyn Validator>>,
}

impl OperationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: AttributeSchema::new(),
            flow: None,
            steps: HashMap::new(),
            validator: None,
        }
    }

    /// Declares attributes accepted by `call`.
    pub fn attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.declare_attributes(names);
        self
    }

    /// Declares attributes introduced by steps mid-flow.
    pub fn transient_attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.declare_transient_attributes(names);
        self
    }

    /// Registers a step handler and the attributes it requires.
    ///
    /// The handler may return a [`FlowResult`] or a raw value; raw values
    /// are subject to the configured wrap policy.
    pub fn step<F, O>(mut self, name: impl Into<String>, required: &[&str], handler: F) -> Self
    where
        F: Fn(&Context, &Attributes) -> Result<O, StepError> + Send + Sync + 'static,
        O: Into<StepOutput>,
    {
        let handler: StepHandler = Arc::new(move |ctx: &Context, attrs: &Attributes| -> StepReturn {
            handler(ctx, attrs).map(Into::into)
        });
        self.steps.insert(
            name.into(),
            StepDefinition {
                required: to_owned_names(required),
                handler: Handler::Step(handler),
            },
        );
        self
    }

    /// Registers a group dispatcher and the attributes it requires.
    ///
    /// The dispatcher runs the nested steps by consuming the
    /// [`Continuation`]; its own return value only matters when it is an error.
    pub fn group<F>(mut self, name: impl Into<String>, required: &[&str], dispatcher: F) -> Self
    where
        F: Fn(&Context, &Attributes, Continuation<'_>) -> Result<(), StepError> + Send + Sync + 'static,
    {
        let dispatcher: GroupHandler = Arc::new(dispatcher);
        self.steps.insert(
            name.into(),
            StepDefinition {
                required: to_owned_names(required),
                handler: Handler::Group(dispatcher),
            },
        );
        self
    }

    /// Declares a single-step operation.
    pub fn perform<F, O>(self, required: &[&str], handler: F) -> Self
    where
        F: Fn(&Context, &Attributes) -> Result<O, StepError> + Send + Sync + 'static,
        O: Into<StepOutput>,
    {
        self.step(PERFORM_STEP, required, handler)
            .flow([Step::named(PERFORM_STEP)])
    }

    /// Sets the ordered list of steps.
    pub fn flow<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Step>,
    {
        self.flow = Some(steps.into_iter().map(Into::into).collect());
        self
    }

    /// Registers a validator that runs before the first step of every call.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn strict_attributes(mut self, strict: bool) -> Self {
        self.schema.set_strict_attributes(strict);
        self
    }

    pub fn strict_transient_attributes(mut self, strict: bool) -> Self {
        self.schema.set_strict_transient_attributes(strict);
        self
    }

    /// Re-raise runtime step errors instead of returning exception results.
    pub fn strict(mut self, strict: bool) -> Self {
        self.schema.set_strict(strict);
        self
    }

    /// Finishes the declaration.
    ///
    /// Fails when a flow step has no matching handler (or a handler of the
    /// wrong kind), when no flow was declared, or when the validator does not
    /// fit the schema.
    pub fn build(self) -> Result<Operation, FlowError> {
        let flow = self.flow.ok_or_else(|| FlowError::UnknownStep {
            operation: self.name.clone(),
            step: PERFORM_STEP.to_string(),
        })?;

        let mut unknown: Option<String> = None;
        for step in &flow {
            step.walk(&mut |s| {
                if unknown.is_some() {
                    return;
                }
                let matches = match (s, self.steps.get(s.name())) {
                    (Step::Named(_), Some(definition)) => !definition.is_group(),
                    (Step::Group(_, _), Some(definition)) => definition.is_group(),
                    (_, None) => false,
                };
                if !matches {
                    unknown = Some(s.name().to_string());
                }
            });
        }
        if let Some(step) = unknown {
            return Err(FlowError::UnknownStep {
                operation: self.name,
                step,
            });
        }

        if let Some(validator) = &self.validator {
            validator
                .check_definition(&self.schema)
                .map_err(|reason| FlowError::ValidationDefinition {
                    operation: self.name.clone(),
                    reason,
                })?;
        }

        debug!(
            "Built operation '{}' with {} top-level steps",
            self.name,
            flow.len()
        );

        Ok(Operation {
            name: Arc::from(self.name),
            schema: self.schema,
            flow,
            steps: self.steps,
            validator: self.validator,
        })
    }
}

fn to_owned_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
