//! Flow Execution Engine
//!
//! Runs the steps of an operation in order, threading attributes from one
//! step to the next:
//! - Attribute gate before the first step and after every merge
//! - Optional validation step in front of the flow
//! - Groups that resume their nested steps through a [`Continuation`]
//! - Tag aggregation per result kind
//!
//! The engine halts at the first failure or exception. Schema violations
//! and runtime step errors interrupt the run and are turned into the
//! caller-facing outcome by the dispatch layer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use log::{debug, warn};
use serde_json::Value;

use super::trace::{EventType, ExecutionTrace};
use crate::config::{Config, UnresumedGroup};
use crate::error::FlowError;
use crate::operation::attributes::{merge_attributes, symbolic_entries};
use crate::operation::{Attributes, Context, FlowResult, Mutation, Operation, ResultKind, StepError, Step, StepOutput};

/// Tag of failures produced from `null`/`false` step returns.
pub const FALSEY_ID: &str = "falsey";

/// Tag of successes produced from other raw step returns.
pub const TRUTHY_ID: &str = "truthy";

/// Tag of the failure produced by a group that never resumed under
/// [`UnresumedGroup::Fail`].
pub const UNRESUMED_ID: &str = "unresumed";

/// Trace name of the implicit validation step.
const VALIDATE_STEP: &str = "validate";

/// Why a run stopped before producing a result.
pub(crate) enum Interrupt {
    /// Programmer error; always reaches the caller as `Err`.
    Violation(FlowError),
    /// Runtime error raised by a step or a dispatcher.
    Raised(StepError),
}

impl From<FlowError> for Interrupt {
    fn from(error: FlowError) -> Self {
        Self::Violation(error)
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Violation(error) => f.debug_tuple("Violation").field(error).finish(),
            Self::Raised(error) => f.debug_tuple("Raised").field(error).finish(),
        }
    }
}

/// How a run was entered; decides which attribute checks apply up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Full call: validation step plus the declared-attribute gate.
    Call,
    /// A single step run in isolation.
    Single,
    /// Nested steps of a group. `replaced` is set when the dispatcher
    /// supplied its own attribute map.
    Nested { replaced: bool },
}

enum Planned<'a> {
    Validate,
    Step(&'a Step),
}

impl Planned<'_> {
    fn name(&self) -> &str {
        match self {
            Self::Validate => VALIDATE_STEP,
            Self::Step(step) => step.name(),
        }
    }
}

/// Executes the flow of one operation instance.
pub(crate) struct FlowEngine<'a> {
    operation: &'a Operation,
    config: &'a Config,
    context: &'a Context,
    trace: RefCell<ExecutionTrace>,
}

impl<'a> FlowEngine<'a> {
    pub(crate) fn new(operation: &'a Operation, config: &'a Config, context: &'a Context) -> Self {
        Self {
            operation,
            config,
            context,
            trace: RefCell::new(ExecutionTrace::new()),
        }
    }

    pub(crate) fn into_trace(self) -> ExecutionTrace {
        self.trace.into_inner()
    }

    /// Runs `steps` starting from `attributes`.
    ///
    /// Returns the last produced result with its tags replaced by the
    /// de-duplicated tags of every step that ended with the same kind.
    pub(crate) fn execute(
        &self,
        steps: &[Step],
        attributes: Attributes,
        entry: Entry,
        depth: usize,
    ) -> Result<FlowResult, Interrupt> {
        let schema = self.operation.schema();

        let mut plan: Vec<Planned<'_>> = Vec::with_capacity(steps.len() + 1);
        if entry == Entry::Call && self.operation.validator().is_some() {
            plan.push(Planned::Validate);
        }
        plan.extend(steps.iter().map(Planned::Step));

        match entry {
            Entry::Call => {
                if schema.resolve_strict_attributes(self.config) {
                    self.check_declared(attributes.keys(), |key| schema.is_attribute(key))?;
                }
            }
            Entry::Single | Entry::Nested { replaced: true } => {
                if schema.resolve_strict_transient_attributes(self.config) {
                    self.check_declared(attributes.keys(), |key| schema.is_known(key))?;
                }
            }
            Entry::Nested { replaced: false } => {}
        }
        if let Some(first) = steps.first() {
            self.check_required(first, &attributes)?;
        }

        let mut attributes = attributes;
        let mut tags: HashMap<ResultKind, Vec<String>> = HashMap::new();
        let mut last: Option<FlowResult> = None;

        for (idx, planned) in plan.iter().enumerate() {
            let outcome = match planned {
                Planned::Validate => Some(self.run_validation(&attributes, depth)),
                Planned::Step(Step::Named(name)) => Some(self.run_named(name, &attributes, depth)?),
                Planned::Step(Step::Group(name, nested)) => {
                    self.run_group(name, nested, &attributes, depth)?
                }
            };

            let next = plan.get(idx + 1);

            if let Some(result) = outcome {
                tags.entry(result.kind())
                    .or_default()
                    .extend(result.ids().iter().cloned());

                if !result.is_success() {
                    debug!("Flow halted at '{}' with {}", planned.name(), result.kind());
                    last = Some(result);
                    break;
                }

                if next.is_some() {
                    if let Some(value) = result.value() {
                        attributes = self.merge(&attributes, value)?;
                    }
                }
                last = Some(result);
            }

            // The first declared step was checked before validation.
            if let (Planned::Step(_), Some(Planned::Step(next))) = (planned, next) {
                self.check_required(next, &attributes)?;
            }
        }

        let result = last.unwrap_or_else(FlowResult::void);
        let ids = tags.remove(&result.kind()).unwrap_or_default();
        Ok(result.mutate(Mutation {
            operation: Some(self.context.operation().clone()),
            ids: Some(ids),
            ..Default::default()
        }))
    }

    /// Overlays the symbolic entries of a step value onto `attributes`.
    fn merge(&self, attributes: &Attributes, value: &Value) -> Result<Attributes, FlowError> {
        let schema = self.operation.schema();
        if schema.resolve_strict_transient_attributes(self.config) {
            if let Some((key, _)) = symbolic_entries(value).find(|(key, _)| !schema.is_known(key)) {
                return Err(self.not_defined(key));
            }
        }
        Ok(merge_attributes(attributes, value))
    }

    fn run_validation(&self, attributes: &Attributes, depth: usize) -> FlowResult {
        self.record(VALIDATE_STEP, depth, EventType::Started);
        let result = match self.operation.validator() {
            Some(validator) => validator.validate(self.context, attributes),
            None => self.context.void(),
        };
        if !result.is_success() {
            debug!("Validation of {} failed: {:?}", self.context.operation(), result.value());
        }
        self.record_outcome(VALIDATE_STEP, depth, &result);
        result
    }

    fn run_named(&self, name: &str, attributes: &Attributes, depth: usize) -> Result<FlowResult, Interrupt> {
        let handler = self
            .operation
            .step_handler(name)
            .ok_or_else(|| self.unknown_step(name))?;

        debug!("Running step '{}' of {}", name, self.context.operation());
        self.record(name, depth, EventType::Started);

        let output = match handler(self.context, attributes) {
            Ok(output) => output,
            Err(error) => {
                self.record(name, depth, EventType::Errored);
                return Err(Interrupt::Raised(error));
            }
        };

        let result = match self.wrap_result(name, output) {
            Ok(result) => result,
            Err(error) => {
                self.record(name, depth, EventType::Errored);
                return Err(error.into());
            }
        };
        self.record_outcome(name, depth, &result);
        Ok(result)
    }

    /// Runs a group dispatcher. `None` means the group passed through
    /// without resuming.
    fn run_group(
        &self,
        name: &str,
        nested: &[Step],
        attributes: &Attributes,
        depth: usize,
    ) -> Result<Option<FlowResult>, Interrupt> {
        let dispatcher = self
            .operation
            .group_handler(name)
            .ok_or_else(|| self.unknown_step(name))?;

        debug!("Entering group '{}' of {}", name, self.context.operation());
        self.record(name, depth, EventType::Started);

        let mut slot: Option<Result<FlowResult, Interrupt>> = None;
        let returned = dispatcher(
            self.context,
            attributes,
            Continuation {
                engine: self,
                steps: nested,
                attributes,
                depth: depth + 1,
                slot: &mut slot,
            },
        );

        let outcome = match (slot, returned) {
            (Some(Err(interrupt)), _) => Err(interrupt),
            (_, Err(error)) => Err(Interrupt::Raised(error)),
            (Some(Ok(result)), Ok(())) => Ok(Some(result)),
            (None, Ok(())) => match self.config.unresumed_group {
                UnresumedGroup::PassThrough => {
                    debug!("Group '{}' did not resume, passing through", name);
                    self.record(name, depth, EventType::PassedThrough);
                    return Ok(None);
                }
                UnresumedGroup::Fail => {
                    warn!("Group '{}' of {} did not resume", name, self.context.operation());
                    Ok(Some(self.context.failure_tagged(&[UNRESUMED_ID], Value::Null)))
                }
            },
        };

        match &outcome {
            Ok(Some(result)) => self.record_outcome(name, depth, result),
            _ => self.record(name, depth, EventType::Errored),
        }
        outcome
    }

    /// Turns a raw step value into a result according to the wrap policy.
    fn wrap_result(&self, step: &str, output: StepOutput) -> Result<FlowResult, FlowError> {
        let value = match output {
            StepOutput::Result(result) => return Ok(result),
            StepOutput::Raw(value) => value,
        };

        let falsey = matches!(value, Value::Null | Value::Bool(false));
        if falsey && self.config.wrap_falsey_result {
            Ok(self.context.failure_tagged(&[FALSEY_ID], value))
        } else if !falsey && self.config.wrap_truthy_result {
            Ok(self.context.success_tagged(&[TRUTHY_ID], value))
        } else {
            Err(FlowError::InvalidResult {
                operation: self.operation.name().to_string(),
                step: step.to_string(),
                value,
            })
        }
    }

    fn check_declared<'k>(
        &self,
        keys: impl Iterator<Item = &'k String>,
        allowed: impl Fn(&str) -> bool,
    ) -> Result<(), FlowError> {
        for key in keys {
            if !allowed(key) {
                return Err(self.not_defined(key));
            }
        }
        Ok(())
    }

    fn check_required(&self, step: &Step, attributes: &Attributes) -> Result<(), FlowError> {
        let step = step.name();
        match self
            .operation
            .required_attributes(step)
            .iter()
            .find(|key| !attributes.contains_key(key.as_str()))
        {
            Some(key) => Err(FlowError::MissingAttribute {
                operation: self.operation.name().to_string(),
                step: step.to_string(),
                key: key.clone(),
            }),
            None => Ok(()),
        }
    }

    fn not_defined(&self, key: &str) -> FlowError {
        FlowError::NotDefinedAttribute {
            operation: self.operation.name().to_string(),
            key: key.to_string(),
        }
    }

    fn unknown_step(&self, step: &str) -> FlowError {
        FlowError::UnknownStep {
            operation: self.operation.name().to_string(),
            step: step.to_string(),
        }
    }

    fn record(&self, step: &str, depth: usize, event_type: EventType) {
        self.trace.borrow_mut().add_event(step, depth, event_type);
    }

    fn record_outcome(&self, step: &str, depth: usize, result: &FlowResult) {
        let event_type = match result.kind() {
            ResultKind::Ok => EventType::Succeeded,
            ResultKind::Failure => EventType::Failed,
            ResultKind::Exception => EventType::Errored,
        };
        self.record(step, depth, event_type);
    }
}

/// Handle given to a group dispatcher to run the group's nested steps.
///
/// Resuming consumes the continuation, so the nested steps run at most
/// once. The nested result becomes the group's result whatever the
/// dispatcher returns afterwards; a nested schema violation or runtime
/// error interrupts the flow even when the dispatcher ignores it.
pub struct Continuation<'c> {
    engine: &'c FlowEngine<'c>,
    steps: &'c [Step],
    attributes: &'c Attributes,
    depth: usize,
    slot: &'c mut Option<Result<FlowResult, Interrupt>>,
}

impl Continuation<'_> {
    /// Runs the nested steps with the group's current attributes.
    ///
    /// Returns the nested result, or `None` when the run was interrupted.
    pub fn resume(self) -> Option<FlowResult> {
        let attributes = self.attributes.clone();
        self.run(attributes, false)
    }

    /// Runs the nested steps with a replacement attribute map.
    pub fn resume_with(self, attributes: Attributes) -> Option<FlowResult> {
        self.run(attributes, true)
    }

    /// The nested steps this continuation would run.
    pub fn steps(&self) -> &[Step] {
        self.steps
    }

    fn run(self, attributes: Attributes, replaced: bool) -> Option<FlowResult> {
        let outcome = self
            .engine
            .execute(self.steps, attributes, Entry::Nested { replaced }, self.depth);
        let result = outcome.as_ref().ok().cloned();
        *self.slot = Some(outcome);
        result
    }
}

impl fmt::Debug for Continuation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("steps", &self.steps)
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::validation::Validations;
    use serde_json::json;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Handler = Box<dyn Fn(&Context, &Attributes) -> Result<FlowResult, StepError> + Send + Sync>;

    fn num(attrs: &Attributes) -> i64 {
        attrs.get("num").and_then(Value::as_i64).unwrap_or(0)
    }

    fn add(delta: i64) -> Handler {
        Box::new(move |ctx: &Context, attrs: &Attributes| -> Result<FlowResult, StepError> {
            Ok(ctx.success(json!({"num": num(attrs) + delta})))
        })
    }

    fn tagged(tag: &'static str) -> Handler {
        Box::new(move |ctx: &Context, attrs: &Attributes| -> Result<FlowResult, StepError> {
            Ok(ctx.success_tagged(&[tag], json!({"num": num(attrs) + 1})))
        })
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Box::new(move |ctx: &Context, _: &Attributes| -> Result<FlowResult, StepError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.void())
        })
    }

    fn raising() -> Handler {
        Box::new(|_: &Context, _: &Attributes| -> Result<FlowResult, StepError> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire").into())
        })
    }

    /// Flow `[add1, inner_add[add2, add3], add4]` where `inner_add` adds 100
    /// before resuming.
    fn grouped(add2: Handler, add4: Handler) -> Operation {
        Operation::builder("Grouped")
            .attributes(["num"])
            .step("add1", &["num"], add(1))
            .step("add2", &["num"], add2)
            .step("add3", &["num"], add(3))
            .step("add4", &["num"], add4)
            .group("inner_add", &["num"], |_, attrs, cont| {
                let mut attrs = attrs.clone();
                attrs.insert("num".to_string(), json!(num(&attrs) + 100));
                cont.resume_with(attrs);
                Ok(())
            })
            .flow([
                Step::named("add1"),
                Step::group("inner_add", ["add2", "add3"]),
                Step::named("add4"),
            ])
            .build()
            .unwrap()
    }

    #[test]
    fn test_grouped_flow_threads_attributes() {
        let op = grouped(add(2), add(4));
        let result = op.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();
        assert!(result.is_success());
        assert_eq!(result.value(), Some(&json!({"num": 1 + 100 + 2 + 3 + 4})));
    }

    #[test]
    fn test_failure_in_group_halts_flow() {
        let after = Arc::new(AtomicUsize::new(0));
        let failing: Handler = Box::new(|ctx: &Context, _: &Attributes| -> Result<FlowResult, StepError> {
            Ok(ctx.failure_tagged(&["b", "b", "nope"], -1))
        });
        let op = grouped(failing, counting(&after));

        let (result, trace) = op
            .call_traced(&Config::default(), attrs! { "num" => 0 })
            .unwrap();
        assert!(result.is_failure());
        assert_eq!(result.value(), Some(&json!(-1)));
        assert_eq!(result.ids(), ["b", "nope"]);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(trace.executed_steps(), vec!["add1", "inner_add", "add2"]);
    }

    #[test]
    fn test_failure_reports_only_failing_tags() {
        let after = Arc::new(AtomicUsize::new(0));
        let op = Operation::builder("Tags")
            .attributes(["num"])
            .step("a", &[], tagged("first"))
            .step("b", &[], |ctx, _| Ok(ctx.failure_tagged(&["broken"], "no")))
            .step("c", &[], counting(&after))
            .flow(["a", "b", "c"])
            .build()
            .unwrap();

        let result = op.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();
        assert!(result.is_failure());
        assert_eq!(result.ids(), ["broken"]);
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_success_aggregates_tags_of_all_steps() {
        let op = Operation::builder("Tags")
            .attributes(["num"])
            .step("a", &[], tagged("x"))
            .step("b", &[], tagged("y"))
            .step("c", &[], tagged("x"))
            .group("g", &[], |_, _, cont| {
                cont.resume();
                Ok(())
            })
            .flow([Step::named("a"), Step::group("g", ["b"]), Step::named("c")])
            .build()
            .unwrap();

        let result = op.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();
        assert!(result.is_success());
        assert_eq!(result.ids(), ["x", "y"]);
        assert_eq!(result.value(), Some(&json!({"num": 3})));
    }

    #[test]
    fn test_result_is_stamped_with_instance() {
        let op = grouped(add(2), add(4));
        let first = op.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();
        let second = op.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();

        assert_eq!(first.operation().map(|o| o.name()), Some("Grouped"));
        assert_ne!(first.operation(), second.operation());
        assert_ne!(first, second);
    }

    #[test]
    fn test_exception_in_nested_step_calls_handlers_once() {
        let after = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let op = grouped(raising(), counting(&after));

        let mut config = Config::default();
        let counter = Arc::clone(&seen);
        config.add_error_handler(move |result| {
            assert!(result.is_error());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = op.call_with(&config, attrs! { "num" => 0 }).unwrap();
        assert!(result.is_error());
        assert_eq!(result.ids(), ["error"]);
        let exception = result.exception_value().unwrap();
        assert_eq!(exception.to_string(), "disk on fire");
        assert!(exception.downcast_ref::<io::Error>().is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_strict_mode_reraises_after_handlers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let op = Operation::builder("Strict")
            .perform(&[], raising())
            .strict(true)
            .build()
            .unwrap();

        let mut config = Config::default();
        let counter = Arc::clone(&seen);
        config.add_error_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = op.call_with(&config, Attributes::new()).unwrap_err();
        assert!(matches!(err, FlowError::Raised(_)));
        assert_eq!(err.to_string(), "disk on fire");
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        config.strict = true;
        let lenient = op.extend("Lenient").strict(false).build().unwrap();
        assert!(lenient.call_with(&config, Attributes::new()).unwrap().is_error());
    }

    #[test]
    fn test_dispatcher_error_after_resume_is_an_exception() {
        let op = Operation::builder("Rollback")
            .step("a", &[], |ctx, _| Ok(ctx.void()))
            .group("tx", &[], |_, _, cont| {
                cont.resume();
                Err("commit failed".into())
            })
            .flow([Step::group("tx", ["a"])])
            .build()
            .unwrap();

        let result = op.call_with(&Config::default(), Attributes::new()).unwrap();
        assert!(result.is_error());
        assert_eq!(result.exception_value().map(|e| e.to_string()), Some("commit failed".to_string()));
    }

    #[test]
    fn test_nested_violation_propagates_when_swallowed() {
        let op = Operation::builder("Swallow")
            .step("a", &["missing"], |ctx, _| Ok(ctx.void()))
            .group("g", &[], |_, _, cont| {
                assert!(cont.resume().is_none());
                Ok(())
            })
            .flow([Step::group("g", ["a"])])
            .build()
            .unwrap();

        let err = op.call_with(&Config::default(), Attributes::new()).unwrap_err();
        assert!(matches!(err, FlowError::MissingAttribute { ref key, .. } if key == "missing"));
    }

    #[test]
    fn test_dispatcher_sees_nested_result() {
        let observed = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&observed);
        let op = Operation::builder("Observe")
            .step("a", &[], |ctx, _| Ok(ctx.failure("bad")))
            .group("g", &[], move |_, _, cont| {
                if cont.resume().map_or(false, |r| r.is_failure()) {
                    flag.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .flow([Step::group("g", ["a"])])
            .build()
            .unwrap();

        let result = op.call_with(&Config::default(), Attributes::new()).unwrap();
        assert!(result.is_failure());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unresumed_group_passes_through_by_default() {
        let op = Operation::builder("Skip")
            .attributes(["num"])
            .step("a", &[], add(1))
            .step("b", &[], add(10))
            .group("never", &[], |_, _, _| Ok(()))
            .flow([Step::named("a"), Step::group("never", ["b"]), Step::named("a")])
            .build()
            .unwrap();

        let (result, trace) = op
            .call_traced(&Config::default(), attrs! { "num" => 0 })
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.value(), Some(&json!({"num": 2})));
        assert!(!trace.executed_steps().contains(&"b"));
        assert!(trace
            .get_events()
            .iter()
            .any(|e| e.step == "never" && e.event_type == EventType::PassedThrough));
    }

    #[test]
    fn test_only_unresumed_groups_yield_untagged_void() {
        let op = Operation::builder("Nothing")
            .step("b", &[], |ctx, _| Ok(ctx.void()))
            .group("never", &[], |_, _, _| Ok(()))
            .flow([Step::group("never", ["b"])])
            .build()
            .unwrap();

        let result = op.call_with(&Config::default(), Attributes::new()).unwrap();
        assert!(result.is_success());
        assert_eq!(result.value(), Some(&Value::Null));
        assert!(result.ids().is_empty());
    }

    #[test]
    fn test_unresumed_group_fail_policy() {
        let op = Operation::builder("Skip")
            .step("b", &[], |ctx, _| Ok(ctx.void()))
            .group("never", &[], |_, _, _| Ok(()))
            .flow([Step::group("never", ["b"])])
            .build()
            .unwrap();

        let mut config = Config::default();
        config.unresumed_group = UnresumedGroup::Fail;
        let result = op.call_with(&config, Attributes::new()).unwrap();
        assert!(result.is_failure());
        assert_eq!(result.ids(), [UNRESUMED_ID]);
    }

    #[test]
    fn test_strict_attributes_rejects_undeclared_keys() {
        let op = Operation::builder("Declared")
            .attributes(["num"])
            .perform(&["num"], |ctx, attrs| Ok(ctx.success(attrs["num"].clone())))
            .build()
            .unwrap();

        let err = op
            .call_with(&Config::default(), attrs! { "num" => 1, "extra" => true })
            .unwrap_err();
        assert!(matches!(err, FlowError::NotDefinedAttribute { ref key, .. } if key == "extra"));

        let mut config = Config::default();
        config.strict_attributes = false;
        let result = op.call_with(&config, attrs! { "num" => 1, "extra" => true }).unwrap();
        assert_eq!(result.value(), Some(&json!(1)));
    }

    #[test]
    fn test_missing_attribute_for_first_and_later_steps() {
        let op = Operation::builder("Required")
            .attributes(["num"])
            .transient_attributes(["total"])
            .step("first", &["num"], |ctx, _| Ok(ctx.success(json!({"other": 1}))))
            .step("second", &["total"], |ctx, _| Ok(ctx.void()))
            .flow(["first", "second"])
            .strict_transient_attributes(false)
            .build()
            .unwrap();

        let err = op.call_with(&Config::default(), Attributes::new()).unwrap_err();
        assert!(matches!(err, FlowError::MissingAttribute { ref step, .. } if step == "first"));

        let err = op.call_with(&Config::default(), attrs! { "num" => 1 }).unwrap_err();
        assert!(matches!(
            err,
            FlowError::MissingAttribute { ref step, ref key, .. } if step == "second" && key == "total"
        ));
    }

    #[test]
    fn test_strict_transient_attributes() {
        let builder = || {
            Operation::builder("Transient")
                .attributes(["num"])
                .step("a", &[], |ctx, _| Ok(ctx.success(json!({"total": 5}))))
                .step("b", &["total"], |ctx, attrs| Ok(ctx.success(attrs["total"].clone())))
                .flow(["a", "b"])
        };

        let err = builder()
            .build()
            .unwrap()
            .call_with(&Config::default(), attrs! { "num" => 0 })
            .unwrap_err();
        assert!(matches!(err, FlowError::NotDefinedAttribute { ref key, .. } if key == "total"));

        let declared = builder().transient_attributes(["total"]).build().unwrap();
        let result = declared.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();
        assert_eq!(result.value(), Some(&json!(5)));

        let sloppy = builder().strict_transient_attributes(false).build().unwrap();
        let result = sloppy.call_with(&Config::default(), attrs! { "num" => 0 }).unwrap();
        assert_eq!(result.value(), Some(&json!(5)));
    }

    #[test]
    fn test_merge_skips_non_objects_and_non_symbolic_keys() {
        let op = Operation::builder("Merge")
            .attributes(["num"])
            .step("scalar", &[], |ctx, _| Ok(ctx.success(42)))
            .step("odd_keys", &[], |ctx, _| Ok(ctx.success(json!({"0": "x", "not a key": 1}))))
            .step("last", &[], |ctx, attrs| Ok(ctx.success(Value::Object(attrs.clone()))))
            .flow(["scalar", "odd_keys", "last"])
            .build()
            .unwrap();

        let result = op.call_with(&Config::default(), attrs! { "num" => 7 }).unwrap();
        assert_eq!(result.value(), Some(&json!({"num": 7})));
    }

    #[test]
    fn test_raw_values_without_wrapping_are_invalid() {
        let op = Operation::builder("Raw")
            .perform(&[], |_, _| Ok(Value::Null))
            .build()
            .unwrap();

        let err = op.call_with(&Config::default(), Attributes::new()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidResult { .. }));
    }

    #[test]
    fn test_wrap_falsey_result() {
        let op = Operation::builder("Falsey")
            .perform(&[], |_, _| Ok(Value::Null))
            .build()
            .unwrap();
        let mut config = Config::default();
        config.wrap_falsey_result = true;

        let result = op.call_with(&config, Attributes::new()).unwrap();
        assert!(result.is_failure());
        assert_eq!(result.value(), Some(&Value::Null));
        assert_eq!(result.ids(), [FALSEY_ID]);
    }

    #[test]
    fn test_wrap_truthy_result() {
        let op = Operation::builder("Truthy")
            .perform(&[], |_, _| Ok(true))
            .build()
            .unwrap();

        let mut falsey_only = Config::default();
        falsey_only.wrap_falsey_result = true;
        assert!(op.call_with(&falsey_only, Attributes::new()).is_err());

        let mut config = Config::default();
        config.wrap_truthy_result = true;
        let result = op.call_with(&config, Attributes::new()).unwrap();
        assert!(result.is_success());
        assert_eq!(result.value(), Some(&json!(true)));
        assert_eq!(result.ids(), [TRUTHY_ID]);
    }

    #[test]
    fn test_validation_halts_before_first_step() {
        let ran = Arc::new(AtomicUsize::new(0));
        let op = Operation::builder("Signup")
            .attributes(["email"])
            .perform(&[], counting(&ran))
            .validator(Validations::new().presence("email"))
            .build()
            .unwrap();

        let (result, trace) = op
            .call_traced(&Config::default(), attrs! { "email" => "" })
            .unwrap();
        assert!(result.is_failure());
        assert_eq!(result.ids(), ["validation"]);
        assert_eq!(result.value(), Some(&json!({"email": ["can't be blank"]})));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(trace.executed_steps(), vec!["validate"]);
    }

    #[test]
    fn test_passing_validation_contributes_void_tag() {
        let op = Operation::builder("Signup")
            .attributes(["email"])
            .perform(&["email"], |ctx, _| Ok(ctx.success_tagged(&["created"], 1)))
            .validator(Validations::new().presence("email"))
            .build()
            .unwrap();

        let result = op
            .call_with(&Config::default(), attrs! { "email" => "a@b.c" })
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.ids(), ["void", "created"]);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        result.on_success(&["void"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_attribute_is_checked_before_validation() {
        let validated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&validated);
        let op = Operation::builder("Signup")
            .attributes(["email", "name"])
            .perform(&["name"], |ctx, _| Ok(ctx.success(1)))
            .validator(move |ctx: &Context, _: &Attributes| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.void()
            })
            .build()
            .unwrap();

        let err = op
            .call_with(&Config::default(), attrs! { "email" => "" })
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::MissingAttribute { ref step, ref key, .. } if step == "call" && key == "name"
        ));
        assert_eq!(validated.load(Ordering::SeqCst), 0);

        let result = op
            .call_with(&Config::default(), attrs! { "email" => "", "name" => "Ana" })
            .unwrap();
        assert!(result.is_success());
        assert_eq!(validated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_with_rejects_undeclared_keys() {
        let builder = || {
            Operation::builder("Replaced")
                .attributes(["num"])
                .step("inc", &["num"], add(1))
                .group("g", &["num"], |_, attrs, cont| {
                    let mut attrs = attrs.clone();
                    attrs.insert("bogus".to_string(), json!(1));
                    cont.resume_with(attrs);
                    Ok(())
                })
                .flow([Step::group("g", ["inc"])])
        };

        let err = builder()
            .build()
            .unwrap()
            .call_with(&Config::default(), attrs! { "num" => 0 })
            .unwrap_err();
        assert!(matches!(err, FlowError::NotDefinedAttribute { ref key, .. } if key == "bogus"));

        let result = builder()
            .strict_transient_attributes(false)
            .build()
            .unwrap()
            .call_with(&Config::default(), attrs! { "num" => 0 })
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.value(), Some(&json!({"num": 1})));
    }

    #[test]
    fn test_run_step_skips_validation_and_accepts_transients() {
        let op = Operation::builder("Checkout")
            .attributes(["email"])
            .transient_attributes(["total"])
            .step("price", &[], |ctx, _| Ok(ctx.success(json!({"total": 10}))))
            .step("charge", &["total"], |ctx, attrs| Ok(ctx.success(attrs["total"].clone())))
            .flow(["price", "charge"])
            .validator(Validations::new().presence("email"))
            .build()
            .unwrap();

        let result = op
            .run_step(&Config::default(), "charge", attrs! { "total" => 3 })
            .unwrap();
        assert_eq!(result.value(), Some(&json!(3)));

        let err = op
            .run_step(&Config::default(), "charge", attrs! { "total" => 3, "coupon" => "x" })
            .unwrap_err();
        assert!(matches!(err, FlowError::NotDefinedAttribute { ref key, .. } if key == "coupon"));
    }

    #[test]
    fn test_run_step_runs_a_whole_group() {
        let op = grouped(add(2), add(4));
        let result = op
            .run_step(&Config::default(), "inner_add", attrs! { "num" => 0 })
            .unwrap();
        assert_eq!(result.value(), Some(&json!({"num": 105})));
    }

    #[test]
    fn test_trace_records_nesting() {
        let op = grouped(add(2), add(4));
        let (_, trace) = op
            .call_traced(&Config::default(), attrs! { "num" => 0 })
            .unwrap();

        assert_eq!(
            trace.executed_steps(),
            vec!["add1", "inner_add", "add2", "add3", "add4"]
        );
        let add2 = trace.get_events().iter().find(|e| e.step == "add2").unwrap();
        assert_eq!(add2.depth, 1);
        assert!(trace.get_durations().contains_key("inner_add"));
    }
}
