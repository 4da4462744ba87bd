//! Configuration changes queued by handles and applied by the loop.

use crate::acquisition::state::AcquisitionState;
use crate::prelude::{StreamError, StreamResult};
use crate::processing::{FilterDesign, FilterId};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ConfigChange {
    AddFilter { id: FilterId, design: FilterDesign },
    RemoveFilter(FilterId),
    ResetFilters,
    Resize { capacity: usize },
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigChange::AddFilter { id, design } => {
                write!(f, "add {} ({})", id, design.spec().kind.short_name())
            }
            ConfigChange::RemoveFilter(id) => write!(f, "remove {}", id),
            ConfigChange::ResetFilters => write!(f, "reset filter state"),
            ConfigChange::Resize { capacity } => write!(f, "resize buffer to {}", capacity),
        }
    }
}

/// Receipt for a queued change. The change is live once the loop's
/// `applied_through` reaches `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeTicket {
    pub id: u64,
    /// Filter created by an add request.
    pub filter: Option<FilterId>,
}

#[derive(Debug)]
pub(crate) struct ChangeRequest {
    pub ticket: u64,
    pub change: ConfigChange,
}

/// Ticket numbering and sending happen under one lock, so channel order
/// equals ticket order across handles.
pub(crate) struct ControlQueue {
    sender: mpsc::UnboundedSender<ChangeRequest>,
    last_ticket: u64,
}

impl ControlQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChangeRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                last_ticket: 0,
            },
            receiver,
        )
    }

    pub fn submit(&mut self, change: ConfigChange) -> StreamResult<ChangeTicket> {
        let filter = match &change {
            ConfigChange::AddFilter { id, .. } => Some(*id),
            _ => None,
        };
        let ticket = self.last_ticket + 1;
        self.sender
            .send(ChangeRequest { ticket, change })
            .map_err(|_| StreamError::InvalidState(AcquisitionState::Closed))?;
        self.last_ticket = ticket;
        Ok(ChangeTicket { id: ticket, filter })
    }
}
