//! Attribute Validation
//!
//! An operation may register a [`Validator`] that runs as an implicit first
//! step of every call. It receives the initial attributes and answers with a
//! result: a success lets the flow continue, a failure halts it before any
//! declared step runs.
//!
//! # Structure
//!
//! - [`Validator`]: the contract every validator implements
//! - [`rules`]: [`Validations`], a rule-based validator

pub mod rules;

pub use rules::Validations;

use crate::operation::{AttributeSchema, Attributes, Context, FlowResult};

/// Tag attached to failures produced by validators.
pub const VALIDATION_ID: &str = "validation";

/// Pre-step check of the attributes supplied to an operation.
pub trait Validator: Send + Sync {
    /// Returns `ctx.void()` when the attributes are acceptable, otherwise a
    /// failure tagged [`VALIDATION_ID`] describing the violations.
    fn validate(&self, ctx: &Context, attributes: &Attributes) -> FlowResult;

    /// Checks the validator against the operation schema when the operation
    /// is built. The error string explains what is wrong.
    fn check_definition(&self, _schema: &AttributeSchema) -> Result<(), String> {
        Ok(())
    }
}

impl<F> Validator for F
where
    F: Fn(&Context, &Attributes) -> FlowResult + Send + Sync,
{
    fn validate(&self, ctx: &Context, attributes: &Attributes) -> FlowResult {
        self(ctx, attributes)
    }
}
