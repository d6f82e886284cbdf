// src/events/mod.rs

//! Events sent from the transaction engine to a consumer
//!
//! An event is a `(kind, text)` pair. Percent events carry a fraction in
//! [0, 1] formatted with two decimals. An event identical to the previous
//! event of the same kind is suppressed by `EventFilter`.

mod channel;

pub use channel::{event_channel, EventReceiver, EventSender, ProcessExit, Received, Terminate};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The closed set of event kinds a consumer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Human-readable status line
    Info,
    /// Fractional progress, formatted with two decimals
    Percent,
    /// Fatal; the process terminates once this has been observed
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Info => write!(f, "info"),
            EventKind::Percent => write!(f, "percent"),
            EventKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub text: String,
}

impl Event {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Info,
            text: text.into(),
        }
    }

    /// A progress event; the value is clamped to [0, 1]
    pub fn percent(value: f64) -> Self {
        let value = if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            kind: EventKind::Percent,
            text: format!("{:.2}", value),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            text: text.into(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.text)
    }
}

/// Suppresses an event that repeats the last event of its kind
#[derive(Debug, Default)]
pub struct EventFilter {
    last: HashMap<EventKind, String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `event` repeats the previous event of its kind
    pub fn admit(&mut self, event: &Event) -> bool {
        if self.last.get(&event.kind) == Some(&event.text) {
            return false;
        }
        self.last.insert(event.kind, event.text.clone());
        true
    }

    /// Text of the last admitted event of `kind`
    pub fn last(&self, kind: EventKind) -> Option<&str> {
        self.last.get(&kind).map(String::as_str)
    }
}
