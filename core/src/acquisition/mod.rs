//! The write path (acquisition loop) and read path (stream handles) over
//! one shared ring buffer.

pub mod control;
pub mod handle;
pub mod runner;
pub mod state;

pub use control::{ChangeTicket, ConfigChange};
pub use handle::{Channels, StreamHandle};
pub use runner::AcquisitionLoop;
pub use state::{AcquisitionState, CloseReason, LoopStatus};

use crate::processing::{FilterId, FilterSpec, RingBuffer};
use crate::telemetry::{LogManager, MetricsRecorder};
use crate::transport::StreamInfo;
use control::ControlQueue;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64};
use tokio::sync::watch;

/// State shared between one loop and its handles. Only the loop writes
/// `buffer`, `info` and `filters`; handles go through `control`.
pub(crate) struct SharedStream {
    pub info: RwLock<Option<StreamInfo>>,
    pub buffer: RwLock<Option<RingBuffer>>,
    pub filters: RwLock<Vec<(FilterId, FilterSpec)>>,
    pub control: Mutex<ControlQueue>,
    pub status: watch::Sender<LoopStatus>,
    pub close_requested: AtomicBool,
    pub next_filter: AtomicU64,
    pub metrics: MetricsRecorder,
    pub logger: LogManager,
}

impl SharedStream {
    pub fn new(name: &str, control: ControlQueue) -> Self {
        let (status, _) = watch::channel(LoopStatus::default());
        Self {
            info: RwLock::new(None),
            buffer: RwLock::new(None),
            filters: RwLock::new(Vec::new()),
            control: Mutex::new(control),
            status,
            close_requested: AtomicBool::new(false),
            next_filter: AtomicU64::new(1),
            metrics: MetricsRecorder::new(),
            logger: LogManager::for_stream(name),
        }
    }

    pub fn allocate_filter_id(&self) -> FilterId {
        FilterId(
            self.next_filter
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }
}
