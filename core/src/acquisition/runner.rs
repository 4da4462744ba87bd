use crate::acquisition::control::{ChangeRequest, ConfigChange, ControlQueue};
use crate::acquisition::handle::StreamHandle;
use crate::acquisition::state::{AcquisitionState, CloseReason};
use crate::acquisition::SharedStream;
use crate::prelude::{Chunk, StreamConfig, StreamError, StreamResult};
use crate::processing::{FilterBank, RingBuffer};
use crate::telemetry::{DropReason, StreamEvent};
use crate::transport::{Pull, StreamInfo, Transport, TransportError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc;

/// Sole writer of a stream: pulls chunks from the transport, filters them
/// and commits them to the ring buffer.
pub struct AcquisitionLoop {
    name: String,
    transport: Box<dyn Transport>,
    config: StreamConfig,
    shared: Arc<SharedStream>,
    control: mpsc::UnboundedReceiver<ChangeRequest>,
    state: AcquisitionState,
    info: Option<StreamInfo>,
    bank: Option<FilterBank>,
    last_timestamp: Option<f64>,
    last_data: Instant,
}

impl AcquisitionLoop {
    pub fn new(transport: impl Transport + 'static, config: StreamConfig) -> StreamResult<Self> {
        Self::named("stream", transport, config)
    }

    pub fn named(
        name: &str,
        transport: impl Transport + 'static,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        config.validate()?;
        let (queue, control) = ControlQueue::new();
        Ok(Self {
            name: name.to_string(),
            transport: Box::new(transport),
            config,
            shared: Arc::new(SharedStream::new(name, queue)),
            control,
            state: AcquisitionState::Idle,
            info: None,
            bank: None,
            last_timestamp: None,
            last_data: Instant::now(),
        })
    }

    /// A new consumer view of this stream.
    pub fn handle(&self) -> StreamHandle {
        StreamHandle::new(self.shared.clone())
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    fn transition(&mut self, to: AcquisitionState) {
        debug_assert!(
            self.state.can_transition(to),
            "illegal transition {:?} -> {:?}",
            self.state,
            to
        );
        let from = self.state;
        self.state = to;
        self.shared.status.send_modify(|status| status.state = to);
        self.shared
            .logger
            .record(&StreamEvent::StateChanged { from, to });
    }

    /// Advances the loop by one iteration.
    ///
    /// Per-chunk problems are logged, counted and absorbed. Stream-level
    /// failures close the stream and are returned once.
    pub fn step(&mut self) -> StreamResult<AcquisitionState> {
        if self.state != AcquisitionState::Closed
            && self.shared.close_requested.load(Ordering::Acquire)
        {
            self.close(CloseReason::Requested);
            return Ok(self.state);
        }
        match self.state {
            AcquisitionState::Idle => self.open()?,
            AcquisitionState::Opening => self.await_first_chunk()?,
            AcquisitionState::Running => {
                self.apply_pending_changes();
                self.pull_and_ingest()?;
            }
            AcquisitionState::Paused | AcquisitionState::Closing | AcquisitionState::Closed => {}
        }
        Ok(self.state)
    }

    /// Steps until the stream closes. Orderly closes return their reason.
    pub fn run(mut self) -> StreamResult<CloseReason> {
        while self.state != AcquisitionState::Closed {
            self.step()?;
        }
        Ok(self
            .shared
            .status
            .borrow()
            .close_reason
            .clone()
            .unwrap_or(CloseReason::Requested))
    }

    /// Runs the loop on a dedicated thread.
    pub fn spawn(self) -> StreamResult<JoinHandle<StreamResult<CloseReason>>> {
        thread::Builder::new()
            .name(format!("acquisition-{}", self.name))
            .spawn(move || self.run())
            .map_err(|e| StreamError::Spawn(e.to_string()))
    }

    fn open(&mut self) -> StreamResult<()> {
        self.transition(AcquisitionState::Opening);
        // one open budget covers resolution and the wait for the first chunk
        self.last_data = Instant::now();
        let info = match self.transport.open(self.config.open_timeout()) {
            Ok(info) => info,
            Err(TransportError::DiscoveryTimeout(waited)) => {
                return self.fail_timeout(waited);
            }
            Err(TransportError::Disconnected(message)) => {
                return self.fail_transport(message);
            }
        };
        if let Err(error) = self.prepare(&info) {
            self.close(CloseReason::Rejected {
                message: error.to_string(),
            });
            return Err(error);
        }
        log::info!(
            target: "streamcore",
            "opened '{}': {} channels @ {} Hz, buffer {} samples",
            info.name,
            info.channels(),
            info.sampling_rate,
            self.config.capacity_for(info.sampling_rate)?
        );
        self.info = Some(info);
        Ok(())
    }

    /// Allocates the buffer and activates the configured filters.
    fn prepare(&mut self, info: &StreamInfo) -> StreamResult<()> {
        info.validate()?;
        let capacity = self.config.capacity_for(info.sampling_rate)?;
        let buffer = RingBuffer::with_capacity(capacity, info.channels())?;

        let mut bank = FilterBank::new(info.channels(), self.config.prime_filters);
        for spec in &self.config.filters {
            let design = spec.bind(info.sampling_rate).and_then(|bound| bound.design());
            match design {
                Ok(design) => bank.add(self.shared.allocate_filter_id(), design)?,
                Err(error) => {
                    self.shared.logger.record(&StreamEvent::FilterRejected {
                        spec: spec.clone(),
                        error: error.to_string(),
                    });
                    return Err(error);
                }
            }
        }

        // info goes last: readers treat it as the sign the buffer exists
        *self.shared.buffer.write() = Some(buffer);
        *self.shared.filters.write() = bank.active();
        *self.shared.info.write() = Some(info.clone());
        self.bank = Some(bank);
        Ok(())
    }

    fn await_first_chunk(&mut self) -> StreamResult<()> {
        match self.transport.pull_chunk(self.config.pull_timeout()) {
            Ok(Pull::Chunk(chunk)) => {
                self.transition(AcquisitionState::Running);
                self.ingest(chunk)
            }
            Ok(Pull::Timeout) => {
                self.shared.metrics.record_empty_pull();
                if self.last_data.elapsed() > self.config.open_timeout() {
                    self.fail_timeout(self.config.open_timeout())
                } else {
                    Ok(())
                }
            }
            Ok(Pull::EndOfStream) => {
                self.close(CloseReason::EndOfStream);
                Ok(())
            }
            Err(TransportError::DiscoveryTimeout(waited)) => self.fail_timeout(waited),
            Err(TransportError::Disconnected(message)) => self.fail_transport(message),
        }
    }

    fn pull_and_ingest(&mut self) -> StreamResult<()> {
        match self.transport.pull_chunk(self.config.pull_timeout()) {
            Ok(Pull::Chunk(chunk)) => self.ingest(chunk),
            Ok(Pull::Timeout) => {
                self.shared.metrics.record_empty_pull();
                if self.last_data.elapsed() > self.config.silence_timeout() {
                    self.fail_timeout(self.config.silence_timeout())
                } else {
                    Ok(())
                }
            }
            Ok(Pull::EndOfStream) => {
                self.close(CloseReason::EndOfStream);
                Ok(())
            }
            Err(TransportError::DiscoveryTimeout(waited)) => self.fail_timeout(waited),
            Err(TransportError::Disconnected(message)) => self.fail_transport(message),
        }
    }

    fn drop_chunk(&self, reason: DropReason, samples: usize, detail: String) {
        self.shared.metrics.record_dropped(reason);
        self.shared.logger.record(&StreamEvent::ChunkDropped {
            reason,
            samples,
            detail,
        });
    }

    /// Validates, filters and commits one chunk.
    fn ingest(&mut self, chunk: Chunk) -> StreamResult<()> {
        let expected = match self.info.as_ref() {
            Some(info) => info.channels(),
            None => return Err(StreamError::InvalidState(self.state)),
        };
        self.last_data = Instant::now();

        if chunk.channels() != expected {
            let actual = chunk.channels();
            self.close(CloseReason::LayoutChanged { expected, actual });
            return Err(StreamError::ChannelLayoutChanged { expected, actual });
        }
        if chunk.timestamps.len() != chunk.len() {
            self.drop_chunk(
                DropReason::Malformed,
                chunk.len(),
                format!(
                    "{} timestamps for {} samples",
                    chunk.timestamps.len(),
                    chunk.len()
                ),
            );
            return Ok(());
        }
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(row) = chunk.timestamps.iter().position(|t| !t.is_finite()) {
            self.drop_chunk(
                DropReason::Malformed,
                chunk.len(),
                format!("timestamp {} of row {} is not finite", chunk.timestamps[row], row),
            );
            return Ok(());
        }

        let first = chunk.first_timestamp().unwrap_or(f64::NEG_INFINITY);
        let behind = self.last_timestamp.is_some_and(|last| first < last);
        if behind || !chunk.is_ordered() {
            self.drop_chunk(
                DropReason::OutOfOrder,
                chunk.len(),
                format!(
                    "chunk starting at {:.6} after {:?}",
                    first, self.last_timestamp
                ),
            );
            return Ok(());
        }

        // checked before filtering so a dropped chunk leaves filter state alone
        let capacity = self
            .shared
            .buffer
            .read()
            .as_ref()
            .map(RingBuffer::capacity)
            .unwrap_or(0);
        if chunk.len() > capacity {
            let error = StreamError::CapacityExceeded {
                chunk: chunk.len(),
                capacity,
            };
            self.drop_chunk(DropReason::CapacityExceeded, chunk.len(), error.to_string());
            return Ok(());
        }

        let filtered = match self.bank.as_mut() {
            Some(bank) => bank.apply(chunk.view()),
            None => return Err(StreamError::InvalidState(self.state)),
        };
        let filtered = match filtered {
            Ok(filtered) => filtered,
            Err(error @ StreamError::NonFiniteInput { .. }) => {
                self.drop_chunk(DropReason::NonFinite, chunk.len(), error.to_string());
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        if let Some(buffer) = self.shared.buffer.write().as_mut() {
            buffer.write(filtered.view(), &chunk.timestamps)?;
        }
        self.last_timestamp = chunk.last_timestamp();
        self.shared.metrics.record_accepted(chunk.len());
        Ok(())
    }

    /// Applies queued changes one at a time, each inside its own pause.
    fn apply_pending_changes(&mut self) {
        while let Ok(request) = self.control.try_recv() {
            self.transition(AcquisitionState::Paused);
            let ticket = request.ticket;
            let description = request.change.to_string();
            match self.apply_change(request.change) {
                Ok(()) => {
                    self.shared
                        .status
                        .send_modify(|status| status.applied_through = ticket);
                    self.shared.metrics.record_change_applied();
                    self.shared.logger.record(&StreamEvent::ConfigApplied {
                        ticket,
                        change: description,
                    });
                }
                Err(error) => {
                    self.shared.logger.record(&StreamEvent::ConfigFailed {
                        ticket,
                        change: description,
                        error: error.to_string(),
                    });
                    self.shared.status.send_modify(|status| {
                        status.record_failure(ticket, error);
                        status.applied_through = ticket;
                    });
                    self.shared.metrics.record_change_failed();
                }
            }
            self.transition(AcquisitionState::Running);
        }
    }

    fn apply_change(&mut self, change: ConfigChange) -> StreamResult<()> {
        let bank = self
            .bank
            .as_mut()
            .ok_or(StreamError::InvalidState(self.state))?;
        match change {
            ConfigChange::AddFilter { id, design } => bank.add(id, design)?,
            ConfigChange::RemoveFilter(id) => {
                if bank.remove(id).is_none() {
                    return Err(StreamError::InvalidFilter(format!("{} is not active", id)));
                }
            }
            ConfigChange::ResetFilters => bank.reset(),
            ConfigChange::Resize { capacity } => {
                if let Some(buffer) = self.shared.buffer.write().as_mut() {
                    buffer.resize(capacity)?;
                }
            }
        }
        *self.shared.filters.write() = bank.active();
        Ok(())
    }

    fn fail_timeout(&mut self, waited: std::time::Duration) -> StreamResult<()> {
        self.shared.logger.record(&StreamEvent::Timeout {
            waited_ms: waited.as_millis() as u64,
        });
        self.close(CloseReason::Timeout);
        Err(StreamError::AcquisitionTimeout(waited))
    }

    fn fail_transport(&mut self, message: String) -> StreamResult<()> {
        self.close(CloseReason::TransportFailure {
            message: message.clone(),
        });
        Err(StreamError::Transport(message))
    }

    /// Releases the transport, the filter state and the ring buffer.
    fn close(&mut self, reason: CloseReason) {
        if matches!(
            self.state,
            AcquisitionState::Closing | AcquisitionState::Closed
        ) {
            return;
        }
        self.transition(AcquisitionState::Closing);
        self.transport.close();
        self.bank = None;
        *self.shared.buffer.write() = None;
        self.shared.filters.write().clear();
        self.control.close();
        self.shared
            .status
            .send_modify(|status| status.close_reason = Some(reason.clone()));
        self.transition(AcquisitionState::Closed);
        self.shared.logger.record(&StreamEvent::Closed { reason });
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.close(CloseReason::Requested);
    }
}
