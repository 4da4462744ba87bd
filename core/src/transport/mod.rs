//! Collaborator interface the acquisition loop pulls chunks from.
//!
//! Discovery and wire formats live behind [`Transport`]; the core only
//! needs fixed stream metadata and a bounded-wait pull.

pub mod channel;
pub mod playback;

use crate::prelude::{Chunk, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use channel::{channel_transport, ChannelTransport, ChunkSender};
pub use playback::{PlaybackConfig, PlaybackEmitter, Recording};

/// Metadata fixed for the lifetime of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub channel_labels: Vec<String>,
    pub sampling_rate: f64,
}

impl StreamInfo {
    pub fn new(name: impl Into<String>, channel_labels: Vec<String>, sampling_rate: f64) -> Self {
        Self {
            name: name.into(),
            channel_labels,
            sampling_rate,
        }
    }

    /// Labels `ch0..chN` for anonymous channels.
    pub fn with_channel_count(name: impl Into<String>, channels: usize, sampling_rate: f64) -> Self {
        Self::new(
            name,
            (0..channels).map(|c| format!("ch{}", c)).collect(),
            sampling_rate,
        )
    }

    pub fn channels(&self) -> usize {
        self.channel_labels.len()
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.channel_labels.is_empty() {
            return Err(StreamError::Transport(format!(
                "stream '{}' advertises no channels",
                self.name
            )));
        }
        if !self.sampling_rate.is_finite() || self.sampling_rate <= 0.0 {
            return Err(StreamError::Transport(format!(
                "stream '{}' advertises an invalid sampling rate {}",
                self.name, self.sampling_rate
            )));
        }
        Ok(())
    }
}

/// Outcome of one bounded-wait pull.
#[derive(Debug, Clone)]
pub enum Pull {
    Chunk(Chunk),
    /// Nothing arrived within the wait.
    Timeout,
    /// The producer finished; no further chunks will arrive.
    EndOfStream,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no stream resolved within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("transport disconnected: {0}")]
    Disconnected(String),
}

/// Source of chunks for one stream.
pub trait Transport: Send {
    /// Resolves the stream and returns its metadata.
    fn open(&mut self, timeout: Duration) -> Result<StreamInfo, TransportError>;

    /// Waits at most `timeout` for the next chunk.
    fn pull_chunk(&mut self, timeout: Duration) -> Result<Pull, TransportError>;

    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, timeout: Duration) -> Result<StreamInfo, TransportError> {
        (**self).open(timeout)
    }

    fn pull_chunk(&mut self, timeout: Duration) -> Result<Pull, TransportError> {
        (**self).pull_chunk(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
