use crate::acquisition::control::{ChangeTicket, ConfigChange};
use crate::acquisition::state::{AcquisitionState, CloseReason, LoopStatus};
use crate::acquisition::SharedStream;
use crate::prelude::{capacity_for, StreamError, StreamResult};
use crate::processing::{FilterId, FilterSpec, RingBuffer, Snapshot};
use crate::telemetry::{MetricsSnapshot, StreamEvent};
use crate::transport::StreamInfo;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Channel selection for reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channels {
    #[default]
    All,
    Indices(Vec<usize>),
    Labels(Vec<String>),
}

impl Channels {
    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Channels::Labels(labels.into_iter().map(Into::into).collect())
    }

    /// Maps the selection onto stream channel indices; `None` means all.
    pub fn resolve(&self, info: &StreamInfo) -> StreamResult<Option<Vec<usize>>> {
        match self {
            Channels::All => Ok(None),
            Channels::Indices(indices) => {
                if let Some(&bad) = indices.iter().find(|&&i| i >= info.channels()) {
                    return Err(StreamError::InvalidChannel(bad));
                }
                Ok(Some(indices.clone()))
            }
            Channels::Labels(labels) => labels
                .iter()
                .map(|label| {
                    info.channel_labels
                        .iter()
                        .position(|l| l == label)
                        .ok_or_else(|| StreamError::UnknownChannel(label.clone()))
                })
                .collect::<StreamResult<Vec<_>>>()
                .map(Some),
        }
    }
}

/// Consumer-side view of one stream.
///
/// Any number of handles may read concurrently with the loop. Each clone
/// keeps its own cursor for [`StreamHandle::read_new`].
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<SharedStream>,
    cursor: u64,
}

impl StreamHandle {
    pub(crate) fn new(shared: Arc<SharedStream>) -> Self {
        Self { shared, cursor: 0 }
    }

    pub fn state(&self) -> AcquisitionState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Stream metadata, available once the transport has been opened.
    pub fn info(&self) -> Option<StreamInfo> {
        self.shared.info.read().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Filters currently applied by the loop, in cascade order.
    pub fn filters(&self) -> Vec<(FilterId, FilterSpec)> {
        self.shared.filters.read().clone()
    }

    /// Receives every structured event in addition to the `log` output.
    pub fn set_event_observer<F>(&self, observer: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.shared.logger.set_observer(observer);
    }

    fn closed_error(&self) -> Option<StreamError> {
        let status = self.shared.status.borrow();
        match (&status.close_reason, status.state) {
            (Some(reason), _) => Some(StreamError::Closed(reason.clone())),
            (None, AcquisitionState::Closing | AcquisitionState::Closed) => {
                Some(StreamError::Closed(CloseReason::Requested))
            }
            _ => None,
        }
    }

    fn with_buffer<F>(&self, channels: &Channels, read: F) -> StreamResult<Snapshot>
    where
        F: FnOnce(&RingBuffer, Option<&[usize]>) -> StreamResult<Snapshot>,
    {
        if let Some(error) = self.closed_error() {
            return Err(error);
        }
        let Some(info) = self.info() else {
            let selected = match channels {
                Channels::Indices(indices) => indices.clone(),
                _ => Vec::new(),
            };
            return Ok(Snapshot::empty(selected, 0));
        };
        let indices = channels.resolve(&info)?;
        let buffer = self.shared.buffer.read();
        match buffer.as_ref() {
            Some(buffer) => read(buffer, indices.as_deref()),
            None => match self.closed_error() {
                Some(error) => Err(error),
                // opened but not yet allocated
                None => Ok(Snapshot::empty(
                    indices.unwrap_or_else(|| (0..info.channels()).collect()),
                    0,
                )),
            },
        }
    }

    /// The most recent `count` samples per selected channel.
    pub fn read(&self, count: usize, channels: &Channels) -> StreamResult<Snapshot> {
        self.with_buffer(channels, |buffer, selected| buffer.read(count, selected))
    }

    /// The most recent `seconds` of data at the stream's nominal rate.
    pub fn read_seconds(&self, seconds: f64, channels: &Channels) -> StreamResult<Snapshot> {
        let count = match self.info() {
            Some(info) => capacity_for(seconds, info.sampling_rate)?,
            None => 0,
        };
        self.read(count, channels)
    }

    /// Every resident sample stamped strictly after `timestamp`.
    pub fn read_since(&self, timestamp: f64, channels: &Channels) -> StreamResult<Snapshot> {
        self.with_buffer(channels, |buffer, selected| {
            buffer.read_since(timestamp, selected)
        })
    }

    /// Samples written since this handle's previous `read_new`. Samples
    /// overwritten in between are reported in `missed`.
    pub fn read_new(&mut self, channels: &Channels) -> StreamResult<Snapshot> {
        let cursor = self.cursor;
        let snapshot =
            self.with_buffer(channels, |buffer, selected| buffer.read_from(cursor, selected))?;
        self.cursor = snapshot.next_index().max(self.cursor);
        Ok(snapshot)
    }

    fn submit(&self, change: ConfigChange) -> StreamResult<ChangeTicket> {
        if let Some(error) = self.closed_error() {
            return Err(error);
        }
        self.shared.control.lock().submit(change).map_err(|error| {
            self.closed_error().unwrap_or(error)
        })
    }

    /// Designs the filter now and queues it for the loop.
    ///
    /// Design failures are returned here and nothing is queued. The rate
    /// comes from the stream, so the stream must have been opened.
    pub fn add_filter(&self, spec: FilterSpec) -> StreamResult<ChangeTicket> {
        let Some(info) = self.info() else {
            return Err(StreamError::InvalidState(self.state()));
        };
        let design = spec
            .bind(info.sampling_rate)
            .and_then(|bound| bound.design());
        let design = match design {
            Ok(design) => design,
            Err(error) => {
                self.shared.logger.record(&StreamEvent::FilterRejected {
                    spec,
                    error: error.to_string(),
                });
                return Err(error);
            }
        };
        let id = self.shared.allocate_filter_id();
        self.submit(ConfigChange::AddFilter { id, design })
    }

    pub fn remove_filter(&self, id: FilterId) -> StreamResult<ChangeTicket> {
        self.submit(ConfigChange::RemoveFilter(id))
    }

    /// Zeroes the history of every active filter.
    pub fn reset_filters(&self) -> StreamResult<ChangeTicket> {
        self.submit(ConfigChange::ResetFilters)
    }

    /// Resizes the rolling window, keeping the most recent samples.
    pub fn resize_buffer(&self, seconds: f64) -> StreamResult<ChangeTicket> {
        let Some(info) = self.info() else {
            return Err(StreamError::InvalidState(self.state()));
        };
        let capacity = capacity_for(seconds, info.sampling_rate)?;
        self.submit(ConfigChange::Resize { capacity })
    }

    /// True once the loop has processed the change, or has closed. A
    /// processed change may still have been refused; see [`Self::change_error`].
    pub fn is_applied(&self, ticket: &ChangeTicket) -> bool {
        let status = self.shared.status.borrow();
        status.applied_through >= ticket.id || status.state.is_closed()
    }

    /// The error the loop refused `ticket` with, if any.
    pub fn change_error(&self, ticket: &ChangeTicket) -> Option<StreamError> {
        self.shared.status.borrow().change_error(ticket.id).cloned()
    }

    /// Resolves once the change is live. Fails with the loop's error if the
    /// change was refused, or with the close reason if the stream closed first.
    pub async fn wait_applied(&self, ticket: &ChangeTicket) -> StreamResult<()> {
        let mut receiver = self.shared.status.subscribe();
        let status = receiver
            .wait_for(|status| status.applied_through >= ticket.id || status.state.is_closed())
            .await
            .map_err(|_| StreamError::Closed(CloseReason::Requested))?
            .clone();
        if let Some(error) = status.change_error(ticket.id) {
            return Err(error.clone());
        }
        match status.close_reason {
            Some(reason) if status.applied_through < ticket.id => Err(StreamError::Closed(reason)),
            _ => Ok(()),
        }
    }

    /// Resolves once the loop reaches `state`. Fails if it closes first.
    pub async fn wait_for_state(&self, state: AcquisitionState) -> StreamResult<()> {
        let mut receiver = self.shared.status.subscribe();
        let status = receiver
            .wait_for(|status| status.state == state || status.state.is_closed())
            .await
            .map_err(|_| StreamError::Closed(CloseReason::Requested))?
            .clone();
        if status.state == state {
            return Ok(());
        }
        Err(StreamError::Closed(
            status.close_reason.unwrap_or(CloseReason::Requested),
        ))
    }

    pub async fn wait_until_running(&self) -> StreamResult<()> {
        self.wait_for_state(AcquisitionState::Running).await
    }

    /// Asks the loop to close at its next iteration boundary.
    pub fn close(&self) {
        self.shared.close_requested.store(true, Ordering::Release);
    }
}
