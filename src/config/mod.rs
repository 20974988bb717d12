//! Runtime Configuration
//!
//! Controls how raw step values are wrapped, the default strictness of
//! operations, what happens to groups that never resume, and which error
//! handlers observe runtime exceptions.
//!
//! A configuration can be passed explicitly to
//! [`Operation::call_with`](crate::Operation::call_with), or installed
//! process-wide with [`configure`] and picked up by
//! [`Operation::call`](crate::Operation::call).
//!
//! # Example
//!
//! ```yaml
//! wrap_falsey_result: true
//! strict: false
//! unresumed_group: fail
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::operation::FlowResult;

/// Callback receiving every exception result produced by an operation call.
pub type ErrorHandler = Arc<dyn Fn(&FlowResult) + Send + Sync>;

/// Behavior of a group whose dispatcher returns without resuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresumedGroup {
    /// The group contributes no result and the flow continues.
    #[default]
    PassThrough,
    /// The group halts the flow with a failure tagged `unresumed`.
    Fail,
}

/// Engine configuration.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Wrap `null`/`false` step returns into failures tagged `falsey`.
    pub wrap_falsey_result: bool,
    /// Wrap any other raw step return into a success tagged `truthy`.
    pub wrap_truthy_result: bool,
    pub strict_attributes: bool,
    pub strict_transient_attributes: bool,
    /// Re-raise runtime step errors after the error handlers ran.
    pub strict: bool,
    pub unresumed_group: UnresumedGroup,
    #[serde(skip)]
    error_handlers: Vec<ErrorHandler>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wrap_falsey_result: false,
            wrap_truthy_result: false,
            strict_attributes: true,
            strict_transient_attributes: true,
            strict: false,
            unresumed_group: UnresumedGroup::PassThrough,
            error_handlers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading config from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses a configuration from YAML text. Missing keys take their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        debug!("Parsed config: {:?}", config);
        Ok(config)
    }

    /// Appends an error handler. Handlers run in registration order.
    pub fn add_error_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&FlowResult) + Send + Sync + 'static,
    {
        self.error_handlers.push(Arc::new(handler));
        self
    }

    pub fn error_handlers(&self) -> &[ErrorHandler] {
        &self.error_handlers
    }

    pub fn clear_error_handlers(&mut self) {
        self.error_handlers.clear();
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("wrap_falsey_result", &self.wrap_falsey_result)
            .field("wrap_truthy_result", &self.wrap_truthy_result)
            .field("strict_attributes", &self.strict_attributes)
            .field("strict_transient_attributes", &self.strict_transient_attributes)
            .field("strict", &self.strict)
            .field("unresumed_group", &self.unresumed_group)
            .field("error_handlers", &self.error_handlers.len())
            .finish()
    }
}

/// Process-wide configuration used by [`Operation::call`](crate::Operation::call).
static GLOBAL: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

/// Updates the process-wide configuration.
///
/// Meant to run at startup, before operations are called.
pub fn configure<F>(update: F)
where
    F: FnOnce(&mut Config),
{
    let mut config = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    update(&mut config);
}

/// Returns a snapshot of the process-wide configuration.
pub fn current() -> Config {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
