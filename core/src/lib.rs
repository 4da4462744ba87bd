//! Real-time multichannel streaming core.
//!
//! An [`AcquisitionLoop`] pulls timestamped chunks from a [`Transport`],
//! runs them through a cascade of IIR filters and commits them to a
//! fixed-capacity ring buffer. Any number of [`StreamHandle`]s read the
//! buffer concurrently and queue configuration changes for the loop.

pub mod acquisition;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod telemetry;
pub mod transport;

pub use acquisition::{
    AcquisitionLoop, AcquisitionState, ChangeTicket, Channels, CloseReason, LoopStatus,
    StreamHandle,
};
pub use prelude::{Chunk, StreamConfig, StreamError, StreamResult};
pub use processing::{FilterId, FilterKind, FilterSpec, Snapshot};
pub use transport::{Pull, StreamInfo, Transport, TransportError};
