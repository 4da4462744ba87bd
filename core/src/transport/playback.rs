//! Replays an in-memory recording as a live stream.
//!
//! Timestamps are derived from a global sample counter that keeps running
//! across repeats, so a looped recording never goes back in time.

use super::{Pull, StreamInfo, Transport, TransportError};
use crate::prelude::{local_clock, Chunk, StreamError, StreamResult};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

/// A static multichannel recording: one row per sample.
#[derive(Debug, Clone)]
pub struct Recording {
    pub samples: Array2<f32>,
    pub sampling_rate: f64,
    pub channel_labels: Vec<String>,
}

impl Recording {
    pub fn new(
        samples: Array2<f32>,
        sampling_rate: f64,
        channel_labels: Vec<String>,
    ) -> StreamResult<Self> {
        if samples.nrows() == 0 {
            return Err(StreamError::InvalidConfig("recording is empty".into()));
        }
        if samples.ncols() != channel_labels.len() {
            return Err(StreamError::InvalidConfig(format!(
                "recording has {} channels but {} labels",
                samples.ncols(),
                channel_labels.len()
            )));
        }
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
            return Err(StreamError::InvalidConfig(format!(
                "recording sampling rate must be positive, got {}",
                sampling_rate
            )));
        }
        Ok(Self {
            samples,
            sampling_rate,
            channel_labels,
        })
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

    pub fn duration_secs(&self) -> f64 {
        self.len() as f64 / self.sampling_rate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub name: String,
    /// Samples per emitted chunk.
    pub chunk_size: usize,
    /// How many times the recording is played; `None` loops forever.
    pub n_repeat: Option<u32>,
    /// Release chunks at wall-clock pace instead of as fast as pulled.
    pub realtime: bool,
    /// Timestamp of the first sample; the local clock at open when unset.
    pub start_time: Option<f64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            name: "playback".into(),
            chunk_size: 32,
            n_repeat: Some(1),
            realtime: true,
            start_time: None,
        }
    }
}

pub struct PlaybackEmitter {
    recording: Recording,
    config: PlaybackConfig,
    cursor: u64,
    origin: f64,
    started: Option<Instant>,
}

impl PlaybackEmitter {
    pub fn new(recording: Recording, config: PlaybackConfig) -> StreamResult<Self> {
        if config.chunk_size == 0 {
            return Err(StreamError::InvalidConfig(
                "playback chunk_size must be positive".into(),
            ));
        }
        if config.n_repeat == Some(0) {
            return Err(StreamError::InvalidConfig(
                "playback n_repeat must be at least 1".into(),
            ));
        }
        Ok(Self {
            recording,
            config,
            cursor: 0,
            origin: 0.0,
            started: None,
        })
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo::new(
            self.config.name.clone(),
            self.recording.channel_labels.clone(),
            self.recording.sampling_rate,
        )
    }

    /// Samples the emitter will produce in total, `None` when looping forever.
    pub fn total_samples(&self) -> Option<u64> {
        self.config
            .n_repeat
            .map(|repeat| u64::from(repeat) * self.recording.len() as u64)
    }

    pub fn emitted(&self) -> u64 {
        self.cursor
    }

    fn remaining(&self) -> u64 {
        self.total_samples()
            .map(|total| total - self.cursor)
            .unwrap_or(u64::MAX)
    }

    /// Size of the next chunk; chunks never straddle a loop boundary.
    fn next_len(&self) -> usize {
        let position = (self.cursor % self.recording.len() as u64) as usize;
        let left_in_pass = self.recording.len() - position;
        (self.config.chunk_size.min(left_in_pass) as u64).min(self.remaining()) as usize
    }

    fn emit(&mut self, rows: usize) -> Chunk {
        let position = (self.cursor % self.recording.len() as u64) as usize;
        let samples = self
            .recording
            .samples
            .slice(s![position..position + rows, ..])
            .to_owned();
        let rate = self.recording.sampling_rate;
        let timestamps = (self.cursor..self.cursor + rows as u64)
            .map(|index| self.origin + index as f64 / rate)
            .collect();
        self.cursor += rows as u64;
        Chunk {
            samples,
            timestamps,
            arrival: local_clock(),
        }
    }
}

impl Transport for PlaybackEmitter {
    fn open(&mut self, _timeout: Duration) -> Result<StreamInfo, TransportError> {
        self.cursor = 0;
        self.origin = self.config.start_time.unwrap_or_else(local_clock);
        self.started = Some(Instant::now());
        log::info!(
            "playback '{}' opened: {} channels @ {} Hz, {:.2} s, repeat {:?}",
            self.config.name,
            self.recording.channels(),
            self.recording.sampling_rate,
            self.recording.duration_secs(),
            self.config.n_repeat
        );
        Ok(self.info())
    }

    fn pull_chunk(&mut self, timeout: Duration) -> Result<Pull, TransportError> {
        let rows = self.next_len();
        if rows == 0 {
            return Ok(Pull::EndOfStream);
        }
        if self.config.realtime {
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = Duration::from_secs_f64(
                (self.cursor + rows as u64) as f64 / self.recording.sampling_rate,
            );
            let elapsed = started.elapsed();
            if due > elapsed {
                let wait = due - elapsed;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(Pull::Timeout);
                }
                thread::sleep(wait);
            }
        }
        Ok(Pull::Chunk(self.emit(rows)))
    }

    fn close(&mut self) {
        log::info!(
            "playback '{}' closed after {} samples",
            self.config.name,
            self.cursor
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::stats::StatsHelper;

    fn recording(rows: usize, rate: f64) -> Recording {
        let samples = Array2::from_shape_fn((rows, 2), |(i, c)| (i * 10 + c) as f32);
        Recording::new(samples, rate, vec!["C3".into(), "C4".into()]).unwrap()
    }

    fn drain(emitter: &mut PlaybackEmitter) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        loop {
            match emitter.pull_chunk(Duration::from_millis(1)).unwrap() {
                Pull::Chunk(chunk) => chunks.push(chunk),
                Pull::EndOfStream => return chunks,
                Pull::Timeout => {}
            }
        }
    }

    #[test]
    fn repeat_continues_time_across_loop_boundary() {
        let config = PlaybackConfig {
            chunk_size: 64,
            n_repeat: Some(2),
            realtime: false,
            start_time: Some(100.0),
            ..Default::default()
        };
        let mut emitter = PlaybackEmitter::new(recording(1000, 100.0), config).unwrap();
        emitter.open(Duration::ZERO).unwrap();
        let chunks = drain(&mut emitter);

        let timestamps: Vec<f64> = chunks.iter().flat_map(|c| c.timestamps.clone()).collect();
        assert_eq!(timestamps.len(), 2000);
        assert!(timestamps.windows(2).all(|pair| pair[1] > pair[0]));
        assert_eq!(StatsHelper::max_regression(&timestamps), 0.0);
        assert!((timestamps[0] - 100.0).abs() < 1e-9);
        assert!((timestamps[1999] - 100.0 - 19.99).abs() < 1e-9);
        assert!((timestamps[1000] - timestamps[999] - 0.01).abs() < 1e-9);

        let values: Vec<f32> = chunks
            .iter()
            .flat_map(|c| c.samples.column(0).to_vec())
            .collect();
        assert_eq!(values[999], 9990.0);
        assert_eq!(values[1000], 0.0);
    }

    #[test]
    fn single_pass_stops_after_recording() {
        let config = PlaybackConfig {
            chunk_size: 7,
            realtime: false,
            ..Default::default()
        };
        let mut emitter = PlaybackEmitter::new(recording(20, 50.0), config).unwrap();
        emitter.open(Duration::ZERO).unwrap();
        let sizes: Vec<usize> = drain(&mut emitter).iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![7, 7, 6]);
        assert!(matches!(
            emitter.pull_chunk(Duration::ZERO),
            Ok(Pull::EndOfStream)
        ));
    }

    #[test]
    fn endless_playback_keeps_emitting() {
        let config = PlaybackConfig {
            chunk_size: 8,
            n_repeat: None,
            realtime: false,
            start_time: Some(0.0),
            ..Default::default()
        };
        let mut emitter = PlaybackEmitter::new(recording(10, 10.0), config).unwrap();
        emitter.open(Duration::ZERO).unwrap();
        for _ in 0..50 {
            assert!(matches!(
                emitter.pull_chunk(Duration::ZERO),
                Ok(Pull::Chunk(_))
            ));
        }
        assert_eq!(emitter.total_samples(), None);
        assert!(emitter.emitted() > 100);
    }

    #[test]
    fn realtime_pacing_times_out_before_chunk_is_due() {
        let config = PlaybackConfig {
            chunk_size: 100,
            realtime: true,
            ..Default::default()
        };
        let mut emitter = PlaybackEmitter::new(recording(200, 100.0), config).unwrap();
        emitter.open(Duration::ZERO).unwrap();
        // first chunk is due one second after open
        assert!(matches!(
            emitter.pull_chunk(Duration::from_millis(5)),
            Ok(Pull::Timeout)
        ));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let zero_repeat = PlaybackConfig {
            n_repeat: Some(0),
            ..Default::default()
        };
        assert!(PlaybackEmitter::new(recording(10, 10.0), zero_repeat).is_err());
        assert!(Recording::new(Array2::zeros((4, 2)), 10.0, vec!["a".into()]).is_err());
        assert!(Recording::new(Array2::zeros((0, 1)), 10.0, vec!["a".into()]).is_err());
    }
}
