pub mod log;
pub mod metrics;

pub use log::{DropReason, EventObserver, LogManager, StreamEvent};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
