// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! camgraph-sim
//!
//! Runs an operating mode end to end on simulated stage drivers.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camgraph::core::selector::HoldKey;
use camgraph::prelude::*;
use camgraph::{SimulatedStageProvider, StillCapture};
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(name = "camgraph-sim")]
#[command(author, version, about = "Run a camera pipeline on simulated hardware", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Operating mode (back, front, reprocessing, vision, high_speed)
    #[arg(long)]
    mode: Option<OperatingMode>,

    /// How long to stream before stopping
    #[arg(long, default_value = "1000")]
    duration_ms: u64,

    /// Still shots to reprocess from held frames before stopping
    #[arg(long, default_value = "0")]
    burst: u32,

    /// Print the topology as JSON and exit
    #[arg(long)]
    dump_topology: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }

    if cli.dump_topology {
        let json = serde_json::to_string_pretty(&config.topology())?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", json)?;
        return Ok(());
    }

    run(&config, Duration::from_millis(cli.duration_ms), cli.burst)
}

fn run(config: &PipelineConfig, duration: Duration, burst: u32) -> Result<()> {
    let pools = Arc::new(
        BufferPools::from_configs(&config.pools, Arc::new(HeapAllocator::new()))
            .context("Failed to allocate buffer pools")?,
    );
    let provider = Arc::new(SimulatedStageProvider::new(config.simulation.clone()));

    let mut preview = GraphFrameFactory::new(
        config.topology(),
        Arc::clone(&pools),
        provider.clone(),
        config.factory_options("preview"),
    )?;
    start(&mut preview)?;
    info!("[camgraph-sim] Streaming {:?} for {:?}", config.mode, duration);
    std::thread::sleep(duration);

    if burst > 0 {
        still_burst(config, &preview, &pools, provider.clone(), burst)?;
    }

    preview.stop_stages()?;
    summarize(&preview, &pools);
    Ok(())
}

fn start(factory: &mut GraphFrameFactory) -> Result<()> {
    factory.build_graph()?;
    factory.wire_pipeline_stages()?;
    factory.prepare_stages()?;
    factory.start_stages()?;
    Ok(())
}

fn still_burst(
    config: &PipelineConfig,
    preview: &GraphFrameFactory,
    pools: &Arc<BufferPools>,
    provider: Arc<SimulatedStageProvider>,
    burst: u32,
) -> Result<()> {
    let held = preview.topology().held_stages();
    let (Some(selector), Some(&(stage, side))) = (preview.selector(), held.first()) else {
        tracing::warn!(
            "[camgraph-sim] {:?} holds no frames, skipping still burst",
            config.mode
        );
        return Ok(());
    };

    let topology = config.topology_for(OperatingMode::Reprocessing);
    let timeout = topology.completion_timeout() * (burst + 1);
    let mut reprocessing = GraphFrameFactory::new(
        topology,
        Arc::clone(pools),
        provider,
        config.factory_options("reprocessing"),
    )?;
    start(&mut reprocessing)?;

    let still = StillCapture::new("still", Arc::clone(selector), HoldKey::new(stage, side));
    let report = still.capture_burst(burst, &reprocessing, timeout);
    reprocessing.stop_stages()?;

    info!(
        "[camgraph-sim] Still burst: {} requested, {} completed, {} skipped, {} failed",
        report.requested, report.completed, report.skipped, report.failed
    );
    Ok(())
}

fn summarize(factory: &GraphFrameFactory, pools: &BufferPools) {
    for stage in &factory.topology().stages {
        if let Some(status) = factory.stage_status(stage.id) {
            info!(
                "[{}] in={} dispatched={} bypassed={} completed={} failed={} regenerated={} input_timeouts={}",
                stage.name,
                status.frames_in,
                status.dispatched,
                status.bypassed,
                status.completed,
                status.failed,
                status.regenerated,
                status.input_timeouts
            );
        }
    }
    if let Some(selector) = factory.selector() {
        info!("[camgraph-sim] Selector: {:?}", selector.stats());
    }
    for name in pools.names() {
        if let Some(pool) = pools.get(&name) {
            info!("[{}] {:?}", name, pool.stats());
        }
    }
    info!(
        "[camgraph-sim] Stopped with {} frames in flight, {} buffers busy",
        factory.in_flight_count(),
        pools.busy_count()
    );
}
