//! Operation Definition Module
//!
//! Provides the building blocks of an operation: attribute schemas, flow
//! steps, step handlers and the results they produce.
//!
//! # Structure
//!
//! - [`attributes`]: Attribute maps, merge rules and the per-operation schema
//! - [`definition`]: [`Operation`], its builder and the per-call [`Context`]
//! - [`result`]: [`FlowResult`] and its tags
//! - [`step`]: Flow steps and step return values

pub mod attributes;
pub mod definition;
pub mod result;
pub mod step;

pub use attributes::{is_symbolic_key, merge_attributes, AttributeSchema, Attributes};
pub use definition::{Context, Operation, OperationBuilder, PERFORM_STEP};
pub use result::{
    FlowResult, Mutation, OperationRef, Payload, ResultKind, StepError, StepException, ERROR_ID,
    VOID_ID,
};
pub use step::{Step, StepOutput, StepReturn};
