//! opflow - Operations with Tagged Results
//!
//! Declares business operations as ordered flows of steps. Each step
//! receives the attributes accumulated so far and answers with a tagged
//! success, failure or exception. The first non-success halts the flow.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`operation`]: Operation declaration, attribute schema, steps and results
//! - [`execution`]: Flow engine, group continuations and the execution trace
//! - [`validation`]: Validators run in front of the flow
//! - [`config`]: Wrap policy, default strictness and error handlers
//! - [`error`]: Programmer errors raised instead of returned
//!
//! # Example
//!
//! ```rust
//! use opflow::{attrs, Config, Operation, Step};
//! use serde_json::json;
//!
//! fn main() -> Result<(), opflow::FlowError> {
//!     let transfer = Operation::builder("Transfer")
//!         .attributes(["amount"])
//!         .transient_attributes(["fee"])
//!         .step("fee", &["amount"], |ctx, attrs| {
//!             let amount = attrs["amount"].as_i64().unwrap_or(0);
//!             Ok(ctx.success(json!({"fee": amount / 100})))
//!         })
//!         .step("debit", &["amount", "fee"], |ctx, attrs| {
//!             Ok(ctx.success_tagged(&["debited"], attrs["fee"].clone()))
//!         })
//!         .flow([Step::named("fee"), Step::named("debit")])
//!         .build()?;
//!
//!     let result = transfer.call_with(&Config::default(), attrs! { "amount" => 500 })?;
//!     result
//!         .on_success(&["debited"], |r| println!("fee charged: {:?}", r.value()))
//!         .on_failure(&[], |r| println!("rejected: {:?}", r.value()));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod operation;
pub mod validation;

// Re-export commonly used types
pub use config::{Config, UnresumedGroup};
pub use error::{ConfigError, FlowError};
pub use execution::{Continuation, ExecutionTrace};
pub use operation::{
    Attributes, Context, FlowResult, Operation, OperationBuilder, ResultKind, Step, StepError,
};
pub use validation::{Validations, Validator};

pub use serde_json;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "opflow";

/// Builds an [`Attributes`] map from `key => value` pairs.
///
/// Values are converted with `serde_json::json!`; nested objects can be
/// passed as `json!({..})` values.
///
/// ```
/// let attrs = opflow::attrs! { "num" => 1, "tags" => ["a", "b"] };
/// assert_eq!(attrs["num"], 1);
/// ```
#[macro_export]
macro_rules! attrs {
    () => {
        $crate::Attributes::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Attributes::new();
        $(map.insert(($key).to_string(), $crate::serde_json::json!($value));)+
        map
    }};
}
