//! Error Types
//!
//! Programmer errors raised while declaring or running operations.
//!
//! Domain failures and runtime step errors are *not* represented here:
//! those travel as [`FlowResult`](crate::operation::FlowResult) values.
//! The only exception is [`FlowError::Raised`], which carries a runtime
//! error back to the caller when an operation runs in strict mode.

use thiserror::Error;

use crate::operation::StepException;

/// Errors that always propagate to the caller of an operation.
#[derive(Debug, Error)]
pub enum FlowError {
    /// An attribute that is not part of the operation schema was supplied
    /// (or returned by a step) while strict checking was enabled.
    #[error("{operation}: attribute '{key}' is not defined")]
    NotDefinedAttribute { operation: String, key: String },

    /// The upcoming step requires an attribute that is not available.
    #[error("{operation}: step '{step}' requires missing attribute '{key}'")]
    MissingAttribute {
        operation: String,
        step: String,
        key: String,
    },

    /// A step returned a raw value and the wrap policy does not cover it.
    #[error(
        "{operation}: step '{step}' must return a result (got {value}); \
         enable wrap_falsey_result / wrap_truthy_result to wrap raw values"
    )]
    InvalidResult {
        operation: String,
        step: String,
        value: serde_json::Value,
    },

    /// The validation rules of an operation are inconsistent with its schema.
    #[error("{operation}: invalid validations: {reason}")]
    ValidationDefinition { operation: String, reason: String },

    /// The flow references a step or group that has no registered handler.
    #[error("{operation}: no handler registered for step '{step}'")]
    UnknownStep { operation: String, step: String },

    /// A runtime step error re-raised because the operation runs in strict mode.
    #[error("{0}")]
    Raised(StepException),
}

/// Errors produced while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl FlowError {
    /// Returns true for the attribute-schema family of violations.
    pub fn is_attribute_error(&self) -> bool {
        matches!(
            self,
            Self::NotDefinedAttribute { .. } | Self::MissingAttribute { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_attribute_display() {
        let err = FlowError::MissingAttribute {
            operation: "Signup".to_string(),
            step: "persist".to_string(),
            key: "email".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Signup: step 'persist' requires missing attribute 'email'"
        );
        assert!(err.is_attribute_error());
    }

    #[test]
    fn test_invalid_result_display_includes_value() {
        let err = FlowError::InvalidResult {
            operation: "Signup".to_string(),
            step: "persist".to_string(),
            value: serde_json::Value::Null,
        };
        assert!(err.to_string().contains("got null"));
        assert!(!err.is_attribute_error());
    }

    #[test]
    fn test_raised_displays_inner_error() {
        let source: Box<dyn std::error::Error + Send + Sync> = "disk on fire".into();
        let err = FlowError::Raised(StepException::from(source));
        assert_eq!(err.to_string(), "disk on fire");
    }
}
