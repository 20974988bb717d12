//! Operation Attributes
//!
//! Attribute maps threaded between steps and the per-operation schema that
//! decides which keys may appear in them.
//!
//! # Merge Rules
//!
//! When a step succeeds with a JSON object, its entries are laid over the
//! current attributes (new values win). Only symbolic keys survive the
//! merge: identifiers such as `total` or `_cursor`. Positional or free-text
//! keys like `"0"` or `"first name"` are dropped.

use serde_json::{Map, Value};

use crate::config::Config;

/// Attribute map passed to steps.
pub type Attributes = Map<String, Value>;

/// Returns true when `key` can be used as an attribute name.
pub fn is_symbolic_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns the symbolic entries of a step value, or nothing when the value
/// is not an object.
pub fn symbolic_entries(value: &Value) -> impl Iterator<Item = (&String, &Value)> {
    value
        .as_object()
        .into_iter()
        .flat_map(|map| map.iter())
        .filter(|(key, _)| is_symbolic_key(key))
}

/// Overlays the symbolic entries of `value` onto `current`.
///
/// Non-object values leave the attributes unchanged.
pub fn merge_attributes(current: &Attributes, value: &Value) -> Attributes {
    let mut merged = current.clone();
    for (key, entry) in symbolic_entries(value) {
        merged.insert(key.clone(), entry.clone());
    }
    merged
}

/// Declared attributes and strictness overrides of one operation type.
///
/// The schema is fixed once the operation is built. Deriving an operation
/// copies the schema, so later declarations on either side stay independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSchema {
    attribute_names: Vec<String>,
    transient_attribute_names: Vec<String>,
    strict_attributes: Option<bool>,
    strict_transient_attributes: Option<bool>,
    strict: Option<bool>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares attributes accepted by `call`. Names already present are skipped.
    pub fn declare_attributes<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        append_unique(&mut self.attribute_names, names);
    }

    /// Declares attributes that steps may introduce mid-flow.
    pub fn declare_transient_attributes<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        append_unique(&mut self.transient_attribute_names, names);
    }

    pub fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    pub fn transient_attribute_names(&self) -> &[String] {
        &self.transient_attribute_names
    }

    pub fn is_attribute(&self, key: &str) -> bool {
        self.attribute_names.iter().any(|name| name == key)
    }

    pub fn is_transient_attribute(&self, key: &str) -> bool {
        self.transient_attribute_names.iter().any(|name| name == key)
    }

    /// True when `key` may appear anywhere in the flow.
    pub fn is_known(&self, key: &str) -> bool {
        self.is_attribute(key) || self.is_transient_attribute(key)
    }

    pub fn set_strict_attributes(&mut self, strict: bool) {
        self.strict_attributes = Some(strict);
    }

    pub fn set_strict_transient_attributes(&mut self, strict: bool) {
        self.strict_transient_attributes = Some(strict);
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = Some(strict);
    }

    pub fn resolve_strict_attributes(&self, config: &Config) -> bool {
        self.strict_attributes.unwrap_or(config.strict_attributes)
    }

    pub fn resolve_strict_transient_attributes(&self, config: &Config) -> bool {
        self.strict_transient_attributes
            .unwrap_or(config.strict_transient_attributes)
    }

    /// Whether runtime errors are re-raised instead of returned.
    pub fn resolve_strict(&self, config: &Config) -> bool {
        self.strict.unwrap_or(config.strict)
    }

    /// Deep copy used when deriving a new operation type.
    pub fn derive(&self) -> Self {
        self.clone()
    }
}

fn append_unique<I, S>(target: &mut Vec<String>, names: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    for name in names {
        let name = name.into();
        if !target.contains(&name) {
            target.push(name);
        }
    }
}
