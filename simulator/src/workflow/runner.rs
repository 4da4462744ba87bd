use crate::generator::profile::build_recording;
use crate::workflow::config::WorkflowConfig;
use anyhow::{anyhow, Context};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use streamcore::math::FftHelper;
use streamcore::telemetry::MetricsSnapshot;
use streamcore::transport::{PlaybackEmitter, Recording};
use streamcore::{AcquisitionLoop, Channels, CloseReason, Snapshot, StreamHandle};

/// Summary of one replay through the stream core.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub stream: String,
    pub channels: usize,
    pub sampling_rate: f64,
    pub filters: Vec<String>,
    pub samples_read: u64,
    pub samples_missed: u64,
    /// Power around the line frequency on the first channel, before and
    /// after filtering, over the same trailing window.
    pub line_power_raw: f64,
    pub line_power_filtered: f64,
    pub close_reason: Option<CloseReason>,
    pub metrics: MetricsSnapshot,
}

impl WorkflowResult {
    pub fn line_reduction_db(&self) -> f64 {
        if self.line_power_filtered <= 0.0 || self.line_power_raw <= 0.0 {
            return 0.0;
        }
        10.0 * (self.line_power_raw / self.line_power_filtered).log10()
    }
}

/// Keeps the trailing window of the first selected channel.
struct Tap {
    window: usize,
    samples: Vec<f32>,
    read: u64,
    missed: u64,
}

impl Tap {
    fn new(window: usize) -> Self {
        Self {
            window,
            samples: Vec::with_capacity(window * 2),
            read: 0,
            missed: 0,
        }
    }

    fn absorb(&mut self, snapshot: &Snapshot) {
        self.read += snapshot.len() as u64;
        self.missed += snapshot.missed;
        if snapshot.is_empty() {
            return;
        }
        self.samples.extend(snapshot.column(0).iter().copied());
        if self.samples.len() > self.window * 2 {
            let excess = self.samples.len() - self.window;
            self.samples.drain(..excess);
        }
    }

    fn tail(&self) -> &[f32] {
        &self.samples[self.samples.len().saturating_sub(self.window)..]
    }
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    fn prepare(&self) -> anyhow::Result<(Recording, AcquisitionLoop)> {
        let recording = build_recording(&self.config.generator)?;
        let emitter = PlaybackEmitter::new(recording.clone(), self.config.playback.clone())
            .context("creating playback emitter")?;
        let acquisition = AcquisitionLoop::named(
            &self.config.playback.name,
            emitter,
            self.config.stream.clone(),
        )
        .context("creating acquisition loop")?;
        Ok((recording, acquisition))
    }

    fn window(&self) -> usize {
        ((self.config.generator.sampling_rate * 4.0) as usize).max(1)
    }

    /// Steps the loop on the calling thread and consumes after every step,
    /// so nothing is overwritten before it is read.
    pub fn execute(&self) -> anyhow::Result<WorkflowResult> {
        let (recording, mut acquisition) = self.prepare()?;
        let mut handle = acquisition.handle();
        let selection = Channels::Indices(vec![0]);
        let mut tap = Tap::new(self.window());
        let mut filters = Vec::new();

        while !acquisition.state().is_closed() {
            acquisition.step().context("stepping acquisition loop")?;
            if acquisition.state().is_closed() {
                break;
            }
            if filters.is_empty() {
                filters = describe_filters(&handle);
            }
            let snapshot = handle.read_new(&selection)?;
            tap.absorb(&snapshot);
        }
        Ok(self.summarize(&recording, &handle, &tap, filters))
    }

    /// Runs the loop on its own thread and polls it until the stream
    /// closes or `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> anyhow::Result<WorkflowResult>
    where
        F: Future<Output = ()>,
    {
        let (recording, acquisition) = self.prepare()?;
        let mut handle = acquisition.handle();
        let worker = acquisition.spawn()?;
        let selection = Channels::Indices(vec![0]);
        let mut tap = Tap::new(self.window());
        let mut filters = Vec::new();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.read_interval_ms.max(1)));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("shutdown requested, closing stream");
                    handle.close();
                    break;
                }
                _ = ticker.tick() => {
                    if handle.is_closed() {
                        break;
                    }
                    if filters.is_empty() {
                        filters = describe_filters(&handle);
                    }
                    match handle.read_new(&selection) {
                        Ok(snapshot) => tap.absorb(&snapshot),
                        Err(error) => {
                            log::debug!("read ended: {}", error);
                            break;
                        }
                    }
                }
            }
        }

        let outcome = tokio::task::spawn_blocking(move || worker.join())
            .await
            .context("joining acquisition thread")?
            .map_err(|_| anyhow!("acquisition thread panicked"))?;
        if let Err(error) = outcome {
            log::warn!("acquisition ended with error: {}", error);
        }
        Ok(self.summarize(&recording, &handle, &tap, filters))
    }

    fn summarize(
        &self,
        recording: &Recording,
        handle: &StreamHandle,
        tap: &Tap,
        filters: Vec<String>,
    ) -> WorkflowResult {
        let generator = &self.config.generator;
        let filtered = tap.tail();
        let raw: Vec<f32> = recording
            .samples
            .column(0)
            .iter()
            .rev()
            .take(filtered.len())
            .rev()
            .copied()
            .collect();
        let mut fft = FftHelper::new(filtered.len());
        let (low, high) = (generator.line_hz - 1.0, generator.line_hz + 1.0);
        let status = handle.status();

        WorkflowResult {
            stream: self.config.playback.name.clone(),
            channels: recording.channels(),
            sampling_rate: recording.sampling_rate,
            filters,
            samples_read: tap.read,
            samples_missed: tap.missed,
            line_power_raw: fft.band_power(&raw, recording.sampling_rate, low, high),
            line_power_filtered: fft.band_power(filtered, recording.sampling_rate, low, high),
            close_reason: status.close_reason,
            metrics: handle.metrics(),
        }
    }
}

fn describe_filters(handle: &StreamHandle) -> Vec<String> {
    handle
        .filters()
        .iter()
        .map(|(id, spec)| format!("{} {:?}", id, spec.kind))
        .collect()
}
