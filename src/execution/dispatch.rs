//! Call boundary: turns engine interrupts into the caller-facing outcome.

use log::{debug, error, warn};

use super::engine::{Entry, FlowEngine, Interrupt};
use super::trace::ExecutionTrace;
use crate::config::Config;
use crate::error::FlowError;
use crate::operation::{Attributes, Context, FlowResult, Operation, Step, StepException};

/// What part of the operation to run.
#[derive(Debug, Clone)]
pub(crate) enum Mode {
    /// The declared flow, preceded by validation.
    Flow,
    /// One step or group of the flow, without validation.
    Single(Step),
}

/// Runs `operation` once on a fresh instance.
///
/// Schema violations come back as `Err`. A runtime step error becomes an
/// exception result that every configured error handler receives once;
/// strict operations then re-raise it as [`FlowError::Raised`].
pub(crate) fn run(
    operation: &Operation,
    config: &Config,
    attributes: Attributes,
    mode: Mode,
) -> Result<(FlowResult, ExecutionTrace), FlowError> {
    let context = Context::new(operation.name_arc(), attributes.clone());
    let engine = FlowEngine::new(operation, config, &context);

    let outcome = match &mode {
        Mode::Flow => engine.execute(operation.flow(), attributes, Entry::Call, 0),
        Mode::Single(step) => {
            engine.execute(std::slice::from_ref(step), attributes, Entry::Single, 0)
        }
    };
    let trace = engine.into_trace();

    match outcome {
        Ok(result) => {
            debug!(
                "{} finished with {} {:?}",
                context.operation(),
                result.kind(),
                result.ids()
            );
            Ok((result, trace))
        }
        Err(Interrupt::Violation(violation)) => {
            warn!("{}", violation);
            Err(violation)
        }
        Err(Interrupt::Raised(raised)) => {
            let exception = StepException::from(raised);
            error!("{} raised: {}", context.operation(), exception);

            let result = context.stamp(FlowResult::exception(exception.clone()));
            for handler in config.error_handlers() {
                handler(&result);
            }

            if operation.schema().resolve_strict(config) {
                Err(FlowError::Raised(exception))
            } else {
                Ok((result, trace))
            }
        }
    }
}
