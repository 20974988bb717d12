//! Execution Trace
//!
//! Records when each step of a call starts and how it ends, including the
//! implicit validation step and the steps of nested groups.

use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

/// Type of trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step ended with a success
    Succeeded,
    /// Step ended with a failure
    Failed,
    /// Step ended with an exception, or raised a runtime error
    Errored,
    /// Group returned without resuming its nested steps
    PassedThrough,
}

impl EventType {
    fn is_end(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution trace.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Name of the step
    pub step: String,
    /// Group nesting level, 0 for top-level steps
    pub depth: usize,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// Ordered record of the steps executed during one call.
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    events: Vec<TraceEvent>,
    start_time: Instant,
}

impl ExecutionTrace {
    /// Creates an empty trace starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step: impl Into<String>, depth: usize, event_type: EventType) {
        self.events.push(TraceEvent {
            step: step.into(),
            depth,
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Names of the steps that started, in execution order.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|event| event.event_type == EventType::Started)
            .map(|event| event.step.as_str())
            .collect()
    }

    /// Returns the total elapsed time since the trace was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns step durations keyed by step name.
    pub fn get_durations(&self) -> HashMap<String, Duration> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            if event.event_type.is_end() {
                if let Some(start) = starts.get(event.step.as_str()) {
                    durations.insert(event.step.clone(), event.timestamp.duration_since(*start));
                }
            } else {
                starts.insert(&event.step, event.timestamp);
            }
        }

        durations
    }

    /// One line per finished step, indented by nesting level.
    pub fn summary(&self) -> String {
        let durations = self.get_durations();
        let mut output = String::new();

        for event in self.events.iter().filter(|event| event.event_type.is_end()) {
            let micros = durations
                .get(&event.step)
                .map(|duration| duration.as_micros())
                .unwrap_or(0);
            let _ = writeln!(
                output,
                "{}{:<20} {:?} ({} us)",
                "  ".repeat(event.depth),
                event.step,
                event.event_type,
                micros
            );
        }

        output
    }
}

impl Default for ExecutionTrace {
    fn default() -> Self {
        Self::new()
    }
}
