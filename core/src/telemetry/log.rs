use crate::prelude::{AcquisitionState, CloseReason, FilterSpec};
use log::Level;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;

/// Why a chunk never reached the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    OutOfOrder,
    NonFinite,
    CapacityExceeded,
    Malformed,
}

/// Structured events reported by the core. Formatting and destination
/// belong to whoever installed the `log` backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChanged {
        from: AcquisitionState,
        to: AcquisitionState,
    },
    ChunkDropped {
        reason: DropReason,
        samples: usize,
        detail: String,
    },
    FilterRejected {
        spec: FilterSpec,
        error: String,
    },
    ConfigApplied {
        ticket: u64,
        change: String,
    },
    ConfigFailed {
        ticket: u64,
        change: String,
        error: String,
    },
    Timeout {
        waited_ms: u64,
    },
    Closed {
        reason: CloseReason,
    },
}

impl StreamEvent {
    pub fn level(&self) -> Level {
        match self {
            StreamEvent::StateChanged { .. } => Level::Info,
            StreamEvent::ChunkDropped { .. }
            | StreamEvent::FilterRejected { .. }
            | StreamEvent::ConfigFailed { .. } => Level::Warn,
            StreamEvent::ConfigApplied { .. } => Level::Debug,
            StreamEvent::Timeout { .. } => Level::Error,
            StreamEvent::Closed { reason } if reason.is_failure() => Level::Error,
            StreamEvent::Closed { .. } => Level::Info,
        }
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEvent::StateChanged { from, to } => write!(f, "state {:?} -> {:?}", from, to),
            StreamEvent::ChunkDropped {
                reason,
                samples,
                detail,
            } => write!(f, "dropped chunk of {} samples ({:?}): {}", samples, reason, detail),
            StreamEvent::FilterRejected { spec, error } => {
                write!(f, "rejected {} filter: {}", spec.kind.short_name(), error)
            }
            StreamEvent::ConfigApplied { ticket, change } => {
                write!(f, "applied change #{}: {}", ticket, change)
            }
            StreamEvent::ConfigFailed {
                ticket,
                change,
                error,
            } => write!(f, "change #{} ({}) failed: {}", ticket, change, error),
            StreamEvent::Timeout { waited_ms } => {
                write!(f, "transport silent for {} ms", waited_ms)
            }
            StreamEvent::Closed { reason } => write!(f, "closed: {}", reason),
        }
    }
}

pub type EventObserver = Box<dyn Fn(&StreamEvent) + Send + Sync>;

pub struct LogManager {
    stream: String,
    observer: RwLock<Option<EventObserver>>,
}

impl LogManager {
    pub fn new() -> Self {
        Self::for_stream("stream")
    }

    pub fn for_stream(name: impl Into<String>) -> Self {
        Self {
            stream: name.into(),
            observer: RwLock::new(None),
        }
    }

    /// Forwards every recorded event to `observer` as well as to `log`.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        *self.observer.write() = Some(Box::new(observer));
    }

    pub fn record(&self, event: &StreamEvent) {
        log::log!(target: "streamcore", event.level(), "[{}] {}", self.stream, event);
        if let Some(observer) = self.observer.read().as_ref() {
            observer(event);
        }
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}
