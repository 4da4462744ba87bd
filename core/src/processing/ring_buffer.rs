use crate::prelude::{StreamError, StreamResult};
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};

/// Copy of a span of the ring buffer, detached from its storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// One row per sample, one column per selected channel.
    pub samples: Array2<f32>,
    pub timestamps: Vec<f64>,
    /// Stream channel index of each column.
    pub channels: Vec<usize>,
    /// Sequence index of the first row.
    pub first_index: u64,
    /// Samples the reader asked for that had already been overwritten.
    pub missed: u64,
}

impl Snapshot {
    pub fn empty(channels: Vec<usize>, first_index: u64) -> Self {
        Self {
            samples: Array2::zeros((0, channels.len())),
            timestamps: Vec::new(),
            channels,
            first_index,
            missed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Sequence index following the last row.
    pub fn next_index(&self) -> u64 {
        self.first_index + self.len() as u64
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.timestamps.last().copied()
    }

    /// Samples of the `column`-th selected channel.
    pub fn column(&self, column: usize) -> ArrayView1<'_, f32> {
        self.samples.index_axis(Axis(1), column)
    }
}

/// Fixed-capacity circular store of timestamped multichannel samples.
///
/// Storage is owned outright; reads return copies so a later write can
/// never alter what a reader already holds.
#[derive(Debug)]
pub struct RingBuffer {
    samples: Array2<f32>,
    timestamps: Vec<f64>,
    head: usize,
    len: usize,
    written: u64,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize, channels: usize) -> StreamResult<Self> {
        if capacity == 0 || channels == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "ring buffer needs a positive capacity and channel count, got {} x {}",
                capacity, channels
            )));
        }
        let cells = capacity
            .checked_mul(channels)
            .filter(|cells| *cells <= isize::MAX as usize / std::mem::size_of::<f32>());
        if cells.is_none() {
            return Err(StreamError::InvalidConfig(format!(
                "ring buffer of {} x {} samples cannot be allocated",
                capacity, channels
            )));
        }
        Ok(Self {
            samples: Array2::zeros((capacity, channels)),
            timestamps: vec![0.0; capacity],
            head: 0,
            len: 0,
            written: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.timestamps.len()
    }

    pub fn channels(&self) -> usize {
        self.samples.ncols()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total number of samples ever written; also the next sequence index.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Sequence index of the oldest resident sample.
    pub fn oldest_index(&self) -> u64 {
        self.written - self.len as u64
    }

    pub fn latest_timestamp(&self) -> Option<f64> {
        if self.len == 0 {
            None
        } else {
            Some(self.timestamps[self.physical(self.len - 1)])
        }
    }

    fn physical(&self, logical: usize) -> usize {
        let capacity = self.capacity();
        (self.head + capacity - self.len + logical) % capacity
    }

    /// Appends every row of `samples`, overwriting the oldest data when full.
    pub fn write(&mut self, samples: ArrayView2<f32>, timestamps: &[f64]) -> StreamResult<()> {
        let rows = samples.nrows();
        if rows != timestamps.len() {
            return Err(StreamError::InvalidChunk(format!(
                "{} sample rows but {} timestamps",
                rows,
                timestamps.len()
            )));
        }
        if samples.ncols() != self.channels() {
            return Err(StreamError::ChannelLayoutChanged {
                expected: self.channels(),
                actual: samples.ncols(),
            });
        }
        let capacity = self.capacity();
        if rows > capacity {
            return Err(StreamError::CapacityExceeded {
                chunk: rows,
                capacity,
            });
        }
        if rows == 0 {
            return Ok(());
        }

        let first = rows.min(capacity - self.head);
        self.samples
            .slice_mut(s![self.head..self.head + first, ..])
            .assign(&samples.slice(s![..first, ..]));
        self.timestamps[self.head..self.head + first].copy_from_slice(&timestamps[..first]);

        let rest = rows - first;
        if rest > 0 {
            self.samples
                .slice_mut(s![..rest, ..])
                .assign(&samples.slice(s![first.., ..]));
            self.timestamps[..rest].copy_from_slice(&timestamps[first..]);
        }

        self.head = (self.head + rows) % capacity;
        self.len = (self.len + rows).min(capacity);
        self.written += rows as u64;
        Ok(())
    }

    fn resolve(&self, channels: Option<&[usize]>) -> StreamResult<Vec<usize>> {
        match channels {
            None => Ok((0..self.channels()).collect()),
            Some(indices) => {
                if let Some(&bad) = indices.iter().find(|&&c| c >= self.channels()) {
                    return Err(StreamError::InvalidChannel(bad));
                }
                Ok(indices.to_vec())
            }
        }
    }

    fn copy_span(&self, start: usize, count: usize, channels: Vec<usize>) -> Snapshot {
        let mut samples = Array2::zeros((count, channels.len()));
        let mut timestamps = Vec::with_capacity(count);
        for row in 0..count {
            let slot = self.physical(start + row);
            timestamps.push(self.timestamps[slot]);
            for (column, &channel) in channels.iter().enumerate() {
                samples[[row, column]] = self.samples[[slot, channel]];
            }
        }
        Snapshot {
            samples,
            timestamps,
            channels,
            first_index: self.oldest_index() + start as u64,
            missed: 0,
        }
    }

    /// Most recent `count` samples, or fewer if fewer are resident.
    pub fn read(&self, count: usize, channels: Option<&[usize]>) -> StreamResult<Snapshot> {
        let channels = self.resolve(channels)?;
        let count = count.min(self.len);
        Ok(self.copy_span(self.len - count, count, channels))
    }

    /// Every resident sample with a timestamp strictly greater than `timestamp`.
    /// A NaN timestamp compares greater than nothing and yields no samples.
    pub fn read_since(&self, timestamp: f64, channels: Option<&[usize]>) -> StreamResult<Snapshot> {
        let channels = self.resolve(channels)?;
        if timestamp.is_nan() {
            return Ok(Snapshot::empty(channels, self.written));
        }
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.timestamps[self.physical(mid)] <= timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(self.copy_span(lo, self.len - lo, channels))
    }

    /// Every resident sample with sequence index >= `index`. Samples before
    /// the resident window are reported through `missed`.
    pub fn read_from(&self, index: u64, channels: Option<&[usize]>) -> StreamResult<Snapshot> {
        let channels = self.resolve(channels)?;
        if index >= self.written {
            return Ok(Snapshot::empty(channels, self.written));
        }
        let oldest = self.oldest_index();
        let start = index.max(oldest);
        let logical = (start - oldest) as usize;
        let mut snapshot = self.copy_span(logical, self.len - logical, channels);
        snapshot.missed = oldest.saturating_sub(index);
        Ok(snapshot)
    }

    /// Reallocates to `capacity`, keeping the most recent samples that fit.
    pub fn resize(&mut self, capacity: usize) -> StreamResult<()> {
        let mut resized = RingBuffer::with_capacity(capacity, self.channels())?;
        let keep = self.len.min(capacity);
        let recent = self.copy_span(self.len - keep, keep, (0..self.channels()).collect());
        resized.write(recent.samples.view(), &recent.timestamps)?;
        resized.written = self.written;
        *self = resized;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
