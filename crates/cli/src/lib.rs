use anyhow::{Context, Result};
use chunkstream_cache::{AggregatedStatistics, CapacityConfig, CapacityLimits, GridPosition, LayerId};
use chunkstream_core::{EngineConfig, SourceSpec, StreamingEngine, SyntheticSource};
use clap::{Parser, Subcommand};
use glam::DVec3;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use viewer_core::{ChunkLayout, LayerTransform, SliceViewport};

#[derive(Debug, Parser)]
#[command(name = "chunkstream-cli")]
#[command(about = "Chunk streaming engine harness")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream a synthetic volume along a scripted camera path and print statistics as JSON.
    Simulate(SimulateArgs),
    /// Print the effective capacity configuration as TOML.
    Config {
        /// Configuration file to read instead of the platform default.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Write the effective configuration to this file.
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    /// Capacity configuration file; defaults, then the file, then the environment apply.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Volume size in voxels as x,y,z.
    #[arg(long, value_delimiter = ',', default_value = "256,256,64")]
    volume: Vec<u64>,
    /// Edge length of the cubic chunks in voxels.
    #[arg(long, default_value_t = 32)]
    chunk: u32,
    /// Number of resolution levels, each half the size of the previous one.
    #[arg(long, default_value_t = 3)]
    scales: u32,
    /// Camera positions along the path.
    #[arg(long, default_value_t = 16)]
    steps: u32,
    #[arg(long, default_value_t = 128)]
    width: u32,
    #[arg(long, default_value_t = 128)]
    height: u32,
    /// Display units per screen pixel.
    #[arg(long, default_value_t = 1.0)]
    pixel_size: f64,
    /// Border in pixels whose chunks are prefetched.
    #[arg(long, default_value_t = 0)]
    prefetch_margin: u32,
    /// Simulated fetch latency per chunk.
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,
    #[arg(long)]
    workers: Option<usize>,
    /// Overrides the GPU memory budget with an item limit.
    #[arg(long)]
    gpu_chunks: Option<usize>,
    /// Chunk of the finest level whose fetch always fails, as x,y,z.
    #[arg(long)]
    fail_chunk: Option<GridPosition>,
    /// How long each camera position may take to settle.
    #[arg(long, default_value_t = 5000)]
    settle_timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct SimulateOutput {
    steps: u32,
    settled_steps: u32,
    fetches: usize,
    elapsed_ms: u128,
    layer_errors: Vec<String>,
    workers: Option<WorkerOutput>,
    statistics: AggregatedStatistics,
}

#[derive(Debug, Serialize)]
struct WorkerOutput {
    completed: u64,
    cancelled: u64,
    failed: u64,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Simulate(args) => run_simulate(&args),
        Commands::Config { config, output } => run_config(config.as_deref(), output.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_capacity(path: Option<&Path>) -> Result<CapacityConfig> {
    if let Some(path) = path {
        ensure_file_exists(path)?;
    }
    let path = path.map(ToOwned::to_owned).unwrap_or_else(CapacityConfig::default_path);
    CapacityConfig::load(Some(&path))
        .with_context(|| format!("failed to load capacity config from {}", path.display()))
}

fn run_config(config: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let capacity = load_capacity(config)?;

    if let Some(output) = output {
        capacity
            .save_to_file(output)
            .with_context(|| format!("failed to write config to {}", output.display()))?;
        println!("{}", output.display());
        return Ok(());
    }

    print!("{}", capacity.to_toml().context("failed to serialize config")?);
    Ok(())
}

fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let volume: [u64; 3] = args
        .volume
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("--volume needs exactly three sizes, got {}", args.volume.len()))?;
    if volume.contains(&0) {
        anyhow::bail!("--volume sizes must be >= 1");
    }
    if args.chunk == 0 {
        anyhow::bail!("--chunk must be >= 1");
    }
    if args.scales == 0 {
        anyhow::bail!("--scales must be >= 1");
    }
    if args.steps == 0 {
        anyhow::bail!("--steps must be >= 1");
    }

    let mut capacity = load_capacity(args.config.as_deref())?;
    if let Some(items) = args.gpu_chunks {
        capacity.gpu_memory = CapacityLimits::items(items);
    }

    let mut config = EngineConfig::new(capacity)
        .with_recompute_quantum(Duration::ZERO)
        .with_prefetch_margin(args.prefetch_margin);
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    let mut engine = StreamingEngine::new(config.clone()).context("failed to start streaming engine")?;

    let (specs, sources) = synthetic_scales(args, volume);
    engine
        .add_layer(LayerId(1), LayerTransform::identity(), specs)
        .context("failed to add synthetic layer")?;

    let started = Instant::now();
    let timeout = Duration::from_millis(args.settle_timeout_ms);
    let mut settled_steps = 0;
    for step in 0..args.steps {
        let viewport = SliceViewport::new(camera_position(volume, step, args.steps), args.width, args.height, args.pixel_size);
        engine
            .set_viewport(config.viewport(viewport))
            .with_context(|| format!("invalid viewport at step {step}"))?;
        if engine.run_until_settled(timeout).context("chunk backend stopped")? {
            settled_steps += 1;
        } else {
            log::warn!("step {} did not settle within {:?}", step, timeout);
        }
    }

    let payload = SimulateOutput {
        steps: args.steps,
        settled_steps,
        fetches: sources.iter().map(|source| source.fetch_count()).sum(),
        elapsed_ms: started.elapsed().as_millis(),
        layer_errors: engine
            .layer_errors()
            .into_iter()
            .map(|(layer, error)| format!("{layer}: {error}"))
            .collect(),
        workers: engine.manager().worker_stats().map(|stats| WorkerOutput {
            completed: stats.completed,
            cancelled: stats.cancelled,
            failed: stats.failed,
        }),
        statistics: engine.statistics(),
    };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    Ok(())
}

/// One source per resolution level, finest first
fn synthetic_scales(args: &SimulateArgs, volume: [u64; 3]) -> (Vec<SourceSpec>, Vec<Arc<SyntheticSource>>) {
    let chunk_size = [args.chunk; 3];
    let mut specs = Vec::new();
    let mut sources = Vec::new();
    for level in 0..args.scales {
        let factor = 1u64 << level.min(31);
        let size = volume.map(|extent| extent.div_ceil(factor).max(1));
        let layout = ChunkLayout::new(chunk_size, size).with_downsample(DVec3::splat(factor as f64));

        let mut source = SyntheticSource::new(chunk_size).with_latency(Duration::from_millis(args.latency_ms));
        if level == 0 {
            if let Some(position) = args.fail_chunk {
                source = source.with_failure(position);
            }
        }
        let source = Arc::new(source);
        specs.push(SourceSpec::new(format!("synthetic/s{level}"), layout, source.clone()));
        sources.push(source);
    }
    (specs, sources)
}

/// Pans across the middle half of the volume along x
fn camera_position(volume: [u64; 3], step: u32, steps: u32) -> DVec3 {
    let [x, y, z] = volume.map(|extent| extent as f64);
    let t = if steps > 1 {
        f64::from(step) / f64::from(steps - 1)
    } else {
        0.0
    };
    DVec3::new(x * (0.25 + 0.5 * t), y * 0.5, z * 0.5)
}

fn ensure_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}
