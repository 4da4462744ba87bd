use anyhow::{ensure, Context};
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use streamcore::transport::Recording;

const MONTAGE: [&str; 8] = ["Fz", "Cz", "Pz", "Oz", "C3", "C4", "P3", "P4"];

/// Configuration for a synthetic multichannel biosignal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub channels: usize,
    pub sampling_rate: f64,
    pub duration_secs: f64,
    /// Dominant rhythm shared by all channels, phase-shifted per channel.
    pub rhythm_hz: f64,
    pub rhythm_amplitude: f64,
    /// Powerline interference.
    pub line_hz: f64,
    pub line_amplitude: f64,
    /// Slow electrode drift added below 1 Hz.
    pub drift_amplitude: f64,
    pub noise: f64,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            sampling_rate: 250.0,
            duration_secs: 10.0,
            rhythm_hz: 10.0,
            rhythm_amplitude: 20.0,
            line_hz: 50.0,
            line_amplitude: 40.0,
            drift_amplitude: 15.0,
            noise: 2.0,
            seed: 0,
        }
    }
}

impl GeneratorConfig {
    fn sample_count(&self) -> anyhow::Result<usize> {
        ensure!(
            self.sampling_rate.is_finite() && self.sampling_rate > 0.0,
            "generator sampling_rate must be positive, got {}",
            self.sampling_rate
        );
        ensure!(
            self.duration_secs.is_finite() && self.duration_secs > 0.0,
            "generator duration_secs must be positive, got {}",
            self.duration_secs
        );
        Ok((self.duration_secs * self.sampling_rate).round() as usize)
    }

    fn labels(&self) -> Vec<String> {
        (0..self.channels)
            .map(|c| match MONTAGE.get(c) {
                Some(label) => (*label).to_string(),
                None => format!("ch{}", c),
            })
            .collect()
    }
}

pub fn build_recording(config: &GeneratorConfig) -> anyhow::Result<Recording> {
    ensure!(config.channels > 0, "generator needs at least one channel");
    let rows = config.sample_count()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let fs = config.sampling_rate;

    let samples = Array2::from_shape_fn((rows, config.channels), |(i, c)| {
        let t = i as f64 / fs;
        let phase = c as f64 * 0.4;
        let rhythm = config.rhythm_amplitude * (2.0 * PI * config.rhythm_hz * t + phase).sin();
        let line = config.line_amplitude * (2.0 * PI * config.line_hz * t).sin();
        let drift = config.drift_amplitude * (2.0 * PI * 0.2 * t + phase).sin();
        let jitter = if config.noise > 0.0 {
            rng.gen_range(-config.noise..config.noise)
        } else {
            0.0
        };
        (rhythm + line + drift + jitter) as f32
    });

    Recording::new(samples, fs, config.labels()).context("building synthetic recording")
}
