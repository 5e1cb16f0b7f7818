//! union CLI
//!
//! Inspection and smoke-testing of the union diffusion backbones.
//!
//! Supports:
//! - Listing and dumping task presets as JSON configs
//! - Building a model and reporting its parameter summary
//! - Timed forward passes on random input

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use union_backbone::{Backbone, BackboneConfig, TaskPreset};
use union_core::summarize_params;

#[cfg(feature = "ndarray")]
type CliBackend = burn_ndarray::NdArray<f32>;

#[cfg(not(feature = "ndarray"))]
compile_error!("union-cli needs a backend feature; enable `ndarray`");

#[derive(Parser)]
#[command(name = "union")]
#[command(about = "Inspect and benchmark ConvChain / Unet diffusion backbones")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in task presets
    Presets,

    /// Print a preset's backbone config as JSON
    Dump {
        /// Preset name (see `union presets`)
        #[arg(short, long)]
        preset: TaskPreset,

        #[command(flatten)]
        size: PresetSize,
    },

    /// Build a model and print its parameter summary
    Inspect {
        #[command(flatten)]
        model: ModelArgs,

        /// Also list every parameter tensor shape
        #[arg(long)]
        shapes: bool,
    },

    /// Run repeated forward passes on random input
    Bench {
        #[command(flatten)]
        model: ModelArgs,

        /// Input height
        #[arg(long, default_value = "64")]
        height: usize,

        /// Input width
        #[arg(long, default_value = "64")]
        width: usize,

        /// Batch size
        #[arg(short, long, default_value = "1")]
        batch: usize,

        /// Number of timed forward passes
        #[arg(short, long, default_value = "5")]
        runs: usize,
    },
}

#[derive(Args)]
struct PresetSize {
    /// Stage width (ConvChain) or base dim (Unet)
    #[arg(long, default_value = "64")]
    filters: usize,

    /// Number of ConvChain stages
    #[arg(long, default_value = "16")]
    depth: usize,
}

#[derive(Args)]
struct ModelArgs {
    /// Built-in preset to build
    #[arg(short, long, conflicts_with = "config")]
    preset: Option<TaskPreset>,

    /// JSON backbone config (`{"kind": "chain" | "unet", ...}`)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    size: PresetSize,
}

impl ModelArgs {
    fn resolve(&self) -> Result<BackboneConfig> {
        match (&self.preset, &self.config) {
            (Some(preset), None) => Ok(preset.config(self.size.filters, self.size.depth)),
            (None, Some(path)) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))
            }
            _ => bail!("Pass exactly one of --preset or --config"),
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "union=info".into());

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Presets => {
            for preset in TaskPreset::ALL {
                println!("{:<20} {}", preset.name(), preset.description());
            }
            Ok(())
        }
        Commands::Dump { preset, size } => {
            let config = preset.config(size.filters, size.depth);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Inspect { model, shapes } => run_inspect(&model.resolve()?, shapes),
        Commands::Bench {
            model,
            height,
            width,
            batch,
            runs,
        } => run_bench(&model.resolve()?, [batch, height, width], runs),
    }
}

fn build_model(config: &BackboneConfig) -> Result<Backbone<CliBackend>> {
    let device = Default::default();
    let start = Instant::now();
    let model = config
        .init::<CliBackend>(&device)
        .context("Failed to build backbone")?;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        emb_dim = model.emb_dim(),
        frame_conditioned = model.is_frame_conditioned(),
        "model built"
    );
    Ok(model)
}

fn run_inspect(config: &BackboneConfig, shapes: bool) -> Result<()> {
    let model = build_model(config)?;
    let summary = summarize_params(&model);

    println!("Model has {:.2} million parameters", summary.millions());
    println!("  tensors: {}", summary.tensor_count());
    println!("  total:   {}", summary.total);
    println!("  in/out:  {} -> {}", config.in_channels(), config.out_channels());

    if shapes {
        for (i, shape) in summary.shapes.iter().enumerate() {
            println!("  [{i:>4}] {shape:?}");
        }
    }
    Ok(())
}

fn run_bench(config: &BackboneConfig, [batch, height, width]: [usize; 3], runs: usize) -> Result<()> {
    if batch == 0 || height == 0 || width == 0 || runs == 0 {
        bail!("batch, height, width and runs must all be positive");
    }

    let device = Default::default();
    let model = build_model(config)?;
    let in_channels = config.in_channels();
    let expected = [batch, config.out_channels(), height, width];

    let pb = ProgressBar::new(runs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut total_ms = 0.0;
    for run in 0..runs {
        let x = Tensor::<CliBackend, 4>::random(
            [batch, in_channels, height, width],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let t = Tensor::<CliBackend, 1>::random([batch], Distribution::Uniform(0.0, 1000.0), &device);
        let frame_diff = model.is_frame_conditioned().then(|| {
            Tensor::<CliBackend, 1>::random([batch], Distribution::Uniform(1.0, 4.0), &device)
        });

        let start = Instant::now();
        let out = model
            .forward(x, t, frame_diff)
            .with_context(|| format!("Forward pass {run} failed"))?;
        let values = out
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("Failed to read output: {err:?}"))?;
        let elapsed = start.elapsed().as_secs_f64() * 1e3;
        total_ms += elapsed;

        if out.dims() != expected {
            bail!("Output shape {:?}, expected {:?}", out.dims(), expected);
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            bail!("Non-finite output value at flat index {pos}");
        }

        tracing::debug!(run, elapsed_ms = elapsed, "forward pass");
        pb.set_message(format!("{elapsed:.1} ms"));
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!(
        "{} forward passes of {:?}: mean {:.2} ms",
        runs,
        expected,
        total_ms / runs as f64
    );
    Ok(())
}
