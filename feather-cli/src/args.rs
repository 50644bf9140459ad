//! Command-line argument definitions for the `feather` binary.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use feather_utils::{DeviceType, Precision, TuningMode};

/// Run CNN models on the CPU or through wgpu compute kernels.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a model, feed one input and run forward passes.
    Run(RunArgs),
    /// Print the layers of a model with their inferred output shapes.
    Inspect(InspectArgs),
}

/// Model files and the runtime overrides shared by every subcommand.
#[derive(Debug, Args)]
pub struct ModelArgs {
    /// Parameter file (JSON layer records).
    #[arg(short, long)]
    pub param: PathBuf,

    /// Weight container. Omit for weightless models.
    #[arg(short, long)]
    pub weights: Option<PathBuf>,

    /// Optional settings JSON. Command-line flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Execution backend: cpu, gpu_buffer or gpu_image.
    #[arg(long)]
    pub device: Option<DeviceType>,

    /// CPU worker threads (0 picks one per core).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Arithmetic precision of GPU kernels: float or half.
    #[arg(long)]
    pub precision: Option<Precision>,

    /// Keep every layer as its own node.
    #[arg(long = "no-fusion", action = ArgAction::SetTrue)]
    pub no_fusion: bool,

    /// Keep every intermediate buffer alive after its last reader.
    #[arg(long = "no-reuse", action = ArgAction::SetTrue)]
    pub no_reuse: bool,

    /// Autotuner mode: disabled, tuning, tuned or tuner_in_process.
    #[arg(long = "tuning")]
    pub tuning_mode: Option<TuningMode>,

    /// Tuning table read in tuned mode and written after a search.
    #[arg(long)]
    pub tuning_table: Option<PathBuf>,

    /// Enable telemetry timing logs.
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Name of the input blob. Defaults to the model's only input.
    #[arg(long)]
    pub input_name: Option<String>,

    /// Input values in NCHW order: a JSON array or raw little-endian f32.
    /// Zeros are fed when omitted.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Blobs to print after the last pass. Defaults to the graph outputs.
    #[arg(short, long = "blob")]
    pub blobs: Vec<String>,

    /// Number of forward passes.
    #[arg(long, default_value_t = 1)]
    pub iterations: usize,

    /// Write the printed blobs to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[command(flatten)]
    pub model: ModelArgs,
}
