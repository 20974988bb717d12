//! Rule-Based Validation
//!
//! [`Validations`] collects per-attribute rules. Every failing rule adds its
//! message under the attribute name, so a failed validation carries a value
//! such as:
//!
//! ```json
//! { "email": ["can't be blank"], "age": ["must be an adult"] }
//! ```

use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::{Map, Value};

use super::{Validator, VALIDATION_ID};
use crate::operation::{AttributeSchema, Attributes, Context, FlowResult};

/// Message used by [`Validations::presence`].
const BLANK_MESSAGE: &str = "can't be blank";

type Predicate = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

#[derive(Clone)]
struct Rule {
    key: String,
    message: String,
    check: Predicate,
}

/// Ordered set of attribute rules.
#[derive(Clone, Default)]
pub struct Validations {
    rules: Vec<Rule>,
}

impl Validations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `key` to be present and not blank.
    pub fn presence(self, key: impl Into<String>) -> Self {
        self.rule(key, BLANK_MESSAGE, |value| value.map_or(false, |v| !is_blank(v)))
    }

    /// Adds a custom rule. `check` receives the attribute value (if any)
    /// and returns true when it is valid.
    pub fn rule<F>(mut self, key: impl Into<String>, message: impl Into<String>, check: F) -> Self
    where
        F: Fn(Option<&Value>) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            key: key.into(),
            message: message.into(),
            check: Arc::new(check),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs every rule and collects the messages of the failing ones.
    pub fn errors(&self, attributes: &Attributes) -> Map<String, Value> {
        let mut errors = Map::new();
        for rule in &self.rules {
            if (rule.check)(attributes.get(&rule.key)) {
                continue;
            }
            debug!("Validation rule failed for '{}': {}", rule.key, rule.message);
            let messages = errors
                .entry(rule.key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = messages {
                list.push(Value::String(rule.message.clone()));
            }
        }
        errors
    }
}

impl Validator for Validations {
    fn validate(&self, ctx: &Context, attributes: &Attributes) -> FlowResult {
        let errors = self.errors(attributes);
        if errors.is_empty() {
            ctx.void()
        } else {
            ctx.failure_tagged(&[VALIDATION_ID], Value::Object(errors))
        }
    }

    fn check_definition(&self, schema: &AttributeSchema) -> Result<(), String> {
        match self.rules.iter().find(|rule| !schema.is_known(&rule.key)) {
            Some(rule) => Err(format!(
                "rule '{}' refers to undeclared attribute '{}'",
                rule.message, rule.key
            )),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Validations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|rule| (&rule.key, &rule.message)))
            .finish()
    }
}

/// Null, blank strings and empty collections count as blank.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
