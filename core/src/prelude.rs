use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use crate::acquisition::state::{AcquisitionState, CloseReason};
pub use crate::processing::biquad::{FilterKind, FilterSpec};

/// Common error type for the streaming core.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("chunk of {chunk} samples exceeds buffer capacity of {capacity}")]
    CapacityExceeded { chunk: usize, capacity: usize },
    #[error("non-finite value at sample {sample}, channel {channel}")]
    NonFiniteInput { sample: usize, channel: usize },
    #[error("unstable filter: {0}")]
    UnstableFilter(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("no data from transport within {0:?}")]
    AcquisitionTimeout(Duration),
    #[error("channel layout changed from {expected} to {actual} channels")]
    ChannelLayoutChanged { expected: usize, actual: usize },
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("channel index {0} out of range")]
    InvalidChannel(usize),
    #[error("unknown channel label '{0}'")]
    UnknownChannel(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("stream closed: {0}")]
    Closed(CloseReason),
    #[error("operation not valid while {0:?}")]
    InvalidState(AcquisitionState),
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Seconds since the Unix epoch on the local clock.
pub fn local_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A batch of samples delivered together by a transport.
///
/// Rows are samples, columns are channels. Every row carries the source
/// timestamp at the same index in `timestamps`; `arrival` is the local
/// clock reading taken when the chunk was pulled.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub samples: Array2<f32>,
    pub timestamps: Vec<f64>,
    pub arrival: f64,
}

impl Chunk {
    pub fn new(samples: Array2<f32>, timestamps: Vec<f64>) -> StreamResult<Self> {
        if samples.nrows() != timestamps.len() {
            return Err(StreamError::InvalidChunk(format!(
                "{} sample rows but {} timestamps",
                samples.nrows(),
                timestamps.len()
            )));
        }
        Ok(Self {
            samples,
            timestamps,
            arrival: local_clock(),
        })
    }

    pub fn with_arrival(mut self, arrival: f64) -> Self {
        self.arrival = arrival;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.nrows() == 0
    }

    pub fn channels(&self) -> usize {
        self.samples.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.samples.view()
    }

    pub fn first_timestamp(&self) -> Option<f64> {
        self.timestamps.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.timestamps.last().copied()
    }

    /// True when source timestamps never decrease inside the chunk.
    pub fn is_ordered(&self) -> bool {
        self.timestamps.windows(2).all(|pair| pair[0] <= pair[1])
    }
}

/// Per-stream configuration, passed to the acquisition loop at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Duration of the rolling window kept in memory.
    pub buffer_seconds: f64,
    /// How long to wait for the first chunk after contacting the transport.
    pub open_timeout_ms: u64,
    /// Longest tolerated transport silence once running.
    pub silence_timeout_ms: u64,
    /// Bound on a single blocking pull.
    pub pull_timeout_ms: u64,
    /// Initialise new filter state at steady state for the first sample.
    pub prime_filters: bool,
    /// Filters active from the first chunk.
    pub filters: Vec<FilterSpec>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 10.0,
            open_timeout_ms: 5_000,
            silence_timeout_ms: 5_000,
            pull_timeout_ms: 50,
            prime_filters: false,
            filters: Vec::new(),
        }
    }
}

impl StreamConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms.max(1))
    }

    pub fn validate(&self) -> StreamResult<()> {
        if !self.buffer_seconds.is_finite() || self.buffer_seconds <= 0.0 {
            return Err(StreamError::InvalidConfig(format!(
                "buffer_seconds must be positive, got {}",
                self.buffer_seconds
            )));
        }
        if self.pull_timeout_ms > self.silence_timeout_ms {
            return Err(StreamError::InvalidConfig(
                "pull_timeout_ms must not exceed silence_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    /// Ring buffer capacity in samples per channel for a given rate.
    pub fn capacity_for(&self, sampling_rate: f64) -> StreamResult<usize> {
        capacity_for(self.buffer_seconds, sampling_rate)
    }
}

/// Upper bound on ring buffer length, in samples per channel.
pub const MAX_CAPACITY: usize = 1 << 28;

pub(crate) fn capacity_for(seconds: f64, sampling_rate: f64) -> StreamResult<usize> {
    if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
        return Err(StreamError::InvalidConfig(format!(
            "sampling rate must be positive, got {}",
            sampling_rate
        )));
    }
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(StreamError::InvalidConfig(format!(
            "window duration must be positive, got {}",
            seconds
        )));
    }
    let samples = (seconds * sampling_rate).ceil();
    if samples > MAX_CAPACITY as f64 {
        return Err(StreamError::InvalidConfig(format!(
            "{}s at {} Hz exceeds the {} sample buffer limit",
            seconds, sampling_rate, MAX_CAPACITY
        )));
    }
    Ok((samples as usize).max(1))
}
