use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use profile_cache::config::Config as CacheConfig;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable `sentry`.
    #[arg(long)]
    sentry: bool,

    /// Enable tracing output, written into a no-op sink.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, sent to a local UDP sink.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = CacheConfig::get(cli.config.as_deref())?;

    let mut logging_guard = logging::init(logging::Config {
        backtraces: config.logging.enable_backtraces,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    })?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        runtime.worker_threads(worker_threads);
    }
    let runtime = runtime.build().context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        if let Some(http_sink) = logging_guard.http_sink.take() {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        let result = perform_stresstest(config, workloads, cli.duration).await;
        drop(logging_guard);
        result
    })
}
