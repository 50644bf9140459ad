//! Runtime context handed to every layer of one net.
//!
//! A [`Runtime`] bundles the CPU worker pool and, when a GPU device type is
//! configured, the [`GpuRuntime`]. It is created once by [`crate::Net::new`]
//! and never reconfigured afterwards.

use std::fmt;

use feather_utils::{
    DeviceType, GpuSettings, Precision, RuntimeSettings, TelemetrySettings, TuningMode,
    TuningSettings, configure_telemetry,
};
use log::info;

use crate::error::{GpuError, NetError, TuningError};
use crate::gpu::GpuRuntime;
use crate::tuner::{Tuner, TuningTable};

/// Construction-time configuration of a net.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub device: DeviceType,
    pub num_threads: usize,
    pub channel_block_size: usize,
    pub precision: Precision,
    pub fusion: bool,
    pub reuse_buffers: bool,
    pub tuning: TuningSettings,
    pub gpu: GpuSettings,
    pub telemetry: TelemetrySettings,
}

impl NetConfig {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            device: settings.device,
            num_threads: settings.num_threads,
            channel_block_size: settings.channel_block_size.max(1),
            precision: settings.precision,
            fusion: settings.fusion,
            reuse_buffers: settings.reuse_buffers,
            tuning: settings.tuning.clone(),
            gpu: settings.gpu.clone(),
            telemetry: settings.telemetry.clone(),
        }
    }

    /// Default configuration on the CPU backend.
    pub fn cpu() -> Self {
        Self::default()
    }

    /// Default configuration on the GPU buffer backend.
    pub fn gpu() -> Self {
        Self {
            device: DeviceType::GpuBuffer,
            ..Self::default()
        }
    }

    pub fn with_fusion(mut self, fusion: bool) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_reuse_buffers(mut self, reuse: bool) -> Self {
        self.reuse_buffers = reuse;
        self
    }

    pub fn with_tuning(mut self, tuning: TuningSettings) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

/// Fixed-size worker pool for CPU layer compute.
pub struct CpuContext {
    pool: rayon::ThreadPool,
}

impl CpuContext {
    /// `num_threads == 0` lets rayon pick one worker per core.
    pub fn new(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("feather-worker-{index}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` inside the pool so nested rayon iterators use its workers.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }
}

impl fmt::Debug for CpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuContext")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

/// Device context, worker pool and tuner for one net.
#[derive(Debug)]
pub struct Runtime {
    config: NetConfig,
    cpu: CpuContext,
    gpu: Option<GpuRuntime>,
}

impl Runtime {
    pub fn new(config: NetConfig) -> Result<Self, NetError> {
        configure_telemetry(config.telemetry.enabled, config.telemetry.level_filter());
        let cpu = CpuContext::new(config.num_threads)?;
        let gpu = match config.device {
            DeviceType::Cpu => None,
            DeviceType::GpuImage => {
                return Err(GpuError::UnsupportedMemoryType(DeviceType::GpuImage.to_string()).into());
            }
            DeviceType::GpuBuffer => {
                let tuner = build_tuner(&config.tuning)?;
                let gpu = GpuRuntime::from_settings(
                    &config.gpu,
                    config.precision,
                    config.channel_block_size,
                    tuner,
                )?;
                info!(
                    target: "feather::gpu",
                    "using adapter '{}' ({:?}), precision {}, tuning {}",
                    gpu.context().adapter_info().name,
                    gpu.context().adapter_info().backend,
                    gpu.precision(),
                    config.tuning.mode
                );
                Some(gpu)
            }
        };
        Ok(Self { config, cpu, gpu })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn cpu(&self) -> &CpuContext {
        &self.cpu
    }

    pub fn gpu(&self) -> Option<&GpuRuntime> {
        self.gpu.as_ref()
    }

    pub fn is_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    /// Channel block of the device layout, `1` on the CPU backend.
    pub fn channel_block_size(&self) -> usize {
        self.gpu
            .as_ref()
            .map_or(1, GpuRuntime::channel_block_size)
    }
}

fn build_tuner(settings: &TuningSettings) -> Result<Tuner, TuningError> {
    let table = match settings.mode {
        TuningMode::Tuned => {
            let path = settings.table_path.as_ref().ok_or(TuningError::NoTablePath)?;
            let table = TuningTable::load_from_path(path)?;
            info!(
                target: "feather::tuner",
                "loaded {} tuning entries from {}",
                table.len(),
                path.display()
            );
            table
        }
        _ => TuningTable::new(),
    };
    Ok(Tuner::new(settings.mode, table, settings.warmup_runs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_settings() {
        let settings = RuntimeSettings {
            device: DeviceType::GpuBuffer,
            channel_block_size: 0,
            fusion: false,
            ..RuntimeSettings::default()
        };
        let config = NetConfig::from_settings(&settings);
        assert_eq!(config.device, DeviceType::GpuBuffer);
        assert_eq!(config.channel_block_size, 1);
        assert!(!config.fusion);
        assert_eq!(NetConfig::gpu().device, DeviceType::GpuBuffer);
    }

    #[test]
    fn image_memory_is_rejected() {
        let config = NetConfig {
            device: DeviceType::GpuImage,
            ..NetConfig::default()
        };
        assert!(matches!(
            Runtime::new(config),
            Err(NetError::Gpu(GpuError::UnsupportedMemoryType(_)))
        ));
    }

    #[test]
    fn tuned_mode_needs_a_table() {
        let settings = TuningSettings {
            mode: TuningMode::Tuned,
            table_path: None,
            warmup_runs: 1,
        };
        assert!(matches!(build_tuner(&settings), Err(TuningError::NoTablePath)));
    }

    #[test]
    fn cpu_runtime_has_workers() {
        let runtime = Runtime::new(NetConfig::cpu().with_num_threads(2)).expect("runtime");
        assert!(!runtime.is_gpu());
        assert_eq!(runtime.cpu().num_threads(), 2);
        assert_eq!(runtime.channel_block_size(), 1);
        assert_eq!(runtime.cpu().install(|| 40 + 2), 42);
    }
}
