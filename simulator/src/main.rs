use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::WorkflowConfig;
use workflow::runner::{Runner, WorkflowResult};

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Headless replay driver for the stream core")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 4)]
    channels: usize,
    #[arg(long, default_value_t = 250.0)]
    sampling_rate: f64,
    /// Length of the synthetic recording in seconds
    #[arg(long, default_value_t = 10.0)]
    duration: f64,
    /// Powerline frequency to inject and notch out
    #[arg(long, default_value_t = 50.0)]
    line_hz: f64,
    /// Optional band-pass as LOW,HIGH in Hz
    #[arg(long, value_delimiter = ',', num_args = 2)]
    band: Option<Vec<f64>>,
    /// Playback repeats; 0 loops until Ctrl+C
    #[arg(long)]
    repeat: Option<u32>,
    /// Pace playback at the recording's sampling rate
    #[arg(long, default_value_t = false)]
    realtime: bool,
    /// Print the summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn print_summary(result: &WorkflowResult, json: bool) -> anyhow::Result<()> {
    if json {
        let text = serde_json::to_string_pretty(result).context("serializing summary")?;
        println!("{}", text);
        return Ok(());
    }
    println!(
        "Stream '{}' -> {} channels @ {} Hz, closed: {}",
        result.stream,
        result.channels,
        result.sampling_rate,
        result
            .close_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "still open".into())
    );
    for filter in &result.filters {
        println!("  filter {}", filter);
    }
    println!(
        "  read {} samples ({} missed), line power {:.3} -> {:.3} ({:.1} dB)",
        result.samples_read,
        result.samples_missed,
        result.line_power_raw,
        result.line_power_filtered,
        result.line_reduction_db()
    );
    let metrics = &result.metrics;
    println!(
        "  accepted {} chunks / {} samples, dropped {}, changes {} ({} refused), empty pulls {}",
        metrics.chunks_accepted,
        metrics.samples_written,
        metrics.chunks_dropped(),
        metrics.changes_applied,
        metrics.changes_failed,
        metrics.empty_pulls
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        let band = args.band.as_deref().map(|edges| (edges[0], edges[1]));
        WorkflowConfig::from_args(
            args.channels,
            args.sampling_rate,
            args.duration,
            args.line_hz,
            band,
        )
    };
    if let Some(repeat) = args.repeat {
        config.playback.n_repeat = (repeat > 0).then_some(repeat);
    }
    if args.realtime {
        config.playback.realtime = true;
    }

    let live = config.playback.realtime || config.playback.n_repeat.is_none();
    let runner = Runner::new(config);
    let result = if live {
        log::info!("replaying live (Ctrl+C to stop)...");
        let runtime = TokioBuilder::new_multi_thread()
            .enable_all()
            .build()
            .context("creating runtime for live replay")?;
        runtime.block_on(runner.serve(async {
            if let Err(error) = signal::ctrl_c().await {
                log::error!("awaiting Ctrl+C failed: {}", error);
                std::future::pending::<()>().await;
            }
        }))?
    } else {
        runner.execute()?
    };

    print_summary(&result, args.json)
}
