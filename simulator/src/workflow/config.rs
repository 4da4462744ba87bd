use crate::generator::profile::GeneratorConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use streamcore::transport::PlaybackConfig;
use streamcore::{FilterSpec, StreamConfig};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub stream: StreamConfig,
    pub generator: GeneratorConfig,
    pub playback: PlaybackConfig,
    /// Consumer poll period when the loop runs on its own thread.
    pub read_interval_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            generator: GeneratorConfig::default(),
            playback: PlaybackConfig::default(),
            read_interval_ms: 100,
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config
            .stream
            .validate()
            .with_context(|| format!("validating stream config {}", path_ref.display()))?;
        Ok(config)
    }

    /// Builds a config from command-line values: a notch at `line_hz`
    /// plus an optional band-pass.
    pub fn from_args(
        channels: usize,
        sampling_rate: f64,
        duration_secs: f64,
        line_hz: f64,
        band: Option<(f64, f64)>,
    ) -> Self {
        let mut filters = vec![FilterSpec::notch(line_hz, 30.0)];
        if let Some((low, high)) = band {
            filters.push(FilterSpec::bandpass(low, high, 4));
        }
        Self {
            stream: StreamConfig {
                filters,
                ..Default::default()
            },
            generator: GeneratorConfig {
                channels,
                sampling_rate,
                duration_secs,
                line_hz,
                ..Default::default()
            },
            playback: PlaybackConfig {
                name: "synthetic".into(),
                realtime: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
