use crate::prelude::StreamError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Idle,
    Opening,
    Running,
    Paused,
    Closing,
    Closed,
}

impl AcquisitionState {
    pub fn can_transition(self, to: AcquisitionState) -> bool {
        use AcquisitionState::*;
        matches!(
            (self, to),
            (Idle, Opening)
                | (Idle, Closing)
                | (Opening, Running)
                | (Opening, Closing)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Closing)
                | (Paused, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == AcquisitionState::Closed
    }
}

/// Why a stream reached `Closed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    EndOfStream,
    Timeout,
    LayoutChanged { expected: usize, actual: usize },
    TransportFailure { message: String },
    Rejected { message: String },
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::Requested | CloseReason::EndOfStream)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "close requested"),
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::Timeout => write!(f, "acquisition timed out"),
            CloseReason::LayoutChanged { expected, actual } => write!(
                f,
                "channel layout changed from {} to {} channels",
                expected, actual
            ),
            CloseReason::TransportFailure { message } => write!(f, "transport failure: {}", message),
            CloseReason::Rejected { message } => write!(f, "rejected at open: {}", message),
        }
    }
}

/// What the loop publishes to every handle after each transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub state: AcquisitionState,
    /// Highest change ticket the loop has processed, successfully or not.
    pub applied_through: u64,
    /// Recently processed tickets whose change was refused, oldest first.
    pub failed_changes: Vec<(u64, StreamError)>,
    pub close_reason: Option<CloseReason>,
}

impl LoopStatus {
    pub(crate) const FAILED_HISTORY: usize = 64;

    /// Why `ticket` was refused, if it was and is still remembered.
    pub fn change_error(&self, ticket: u64) -> Option<&StreamError> {
        self.failed_changes
            .iter()
            .find(|(id, _)| *id == ticket)
            .map(|(_, error)| error)
    }

    pub(crate) fn record_failure(&mut self, ticket: u64, error: StreamError) {
        if self.failed_changes.len() == Self::FAILED_HISTORY {
            self.failed_changes.remove(0);
        }
        self.failed_changes.push((ticket, error));
    }
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: AcquisitionState::Idle,
            applied_through: 0,
            failed_changes: Vec::new(),
            close_reason: None,
        }
    }
}
