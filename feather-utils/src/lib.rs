//! Settings, logging and device plumbing used by the Feather engine and CLI.

pub mod config;
/// wgpu device setup and the device buffer pool.
pub mod gpu;
pub mod telemetry;

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    DeviceType, GpuSettings, Precision, RuntimeSettings, TelemetrySettings, TuningMode,
    TuningSettings,
};
pub use gpu::{
    BufferPoolError, ComputeLimits, GpuAvailability, GpuBufferPool, GpuContext, GpuContextOptions,
    GpuInitError,
};
pub use telemetry::{TimingGuard, configure as configure_telemetry, telemetry_allows, timing_guard};

/// Install the process-wide logger.
///
/// `level` applies to everything unless `RUST_LOG` says otherwise; the
/// telemetry target is never filtered here since [`configure_telemetry`]
/// gates it. Calling this twice is harmless.
pub fn init_logging(level: LevelFilter) -> Result<()> {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .filter_module("feather::telemetry", LevelFilter::Trace)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
    Ok(())
}
