//! Runtime configuration shared by the inference core and the CLI.
//!
//! Settings are serialized as JSON so a tuned deployment can ship the same file
//! it was tuned with. Every section uses `#[serde(default)]`, so partial files
//! are valid.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Backend a network executes on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Multi-threaded host kernels.
    #[default]
    Cpu,
    /// Compute kernels over device storage buffers.
    GpuBuffer,
    /// Texture-backed kernels. Accepted by configuration, rejected by the runtime.
    GpuImage,
}

impl DeviceType {
    pub fn is_gpu(self) -> bool {
        matches!(self, DeviceType::GpuBuffer | DeviceType::GpuImage)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Cpu => "cpu",
            DeviceType::GpuBuffer => "gpu_buffer",
            DeviceType::GpuImage => "gpu_image",
        })
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" | "gpu_buffer" => Ok(DeviceType::GpuBuffer),
            "gpu_image" => Ok(DeviceType::GpuImage),
            other => Err(format!(
                "invalid device '{other}'; expected 'cpu', 'gpu_buffer' or 'gpu_image'"
            )),
        }
    }
}

/// How GPU layers obtain their launch geometry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    /// Use the derived default geometry with no search and no table.
    #[default]
    Disabled,
    /// Search every kernel's candidates once and record the winners.
    Tuning,
    /// Read every geometry from a persisted table. Missing keys are fatal.
    Tuned,
    /// Evaluate one candidate per launch until the search converges.
    TunerInProcess,
}

impl TuningMode {
    /// Modes that write measurements into the tuning table.
    pub fn records(self) -> bool {
        matches!(self, TuningMode::Tuning | TuningMode::TunerInProcess)
    }
}

impl fmt::Display for TuningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TuningMode::Disabled => "disabled",
            TuningMode::Tuning => "tuning",
            TuningMode::Tuned => "tuned",
            TuningMode::TunerInProcess => "tuner_in_process",
        })
    }
}

impl FromStr for TuningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "disabled" | "off" => Ok(TuningMode::Disabled),
            "tuning" => Ok(TuningMode::Tuning),
            "tuned" => Ok(TuningMode::Tuned),
            "tuner_in_process" | "in_process" => Ok(TuningMode::TunerInProcess),
            other => Err(format!(
                "invalid tuning mode '{other}'; expected 'disabled', 'tuning', 'tuned' or 'tuner_in_process'"
            )),
        }
    }
}

/// Arithmetic type GPU kernels are compiled with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Float,
    Half,
}

impl Precision {
    /// Value of the `DATA_TYPE` build option.
    pub fn data_type(self) -> &'static str {
        match self {
            Precision::Float => "float",
            Precision::Half => "half",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.data_type())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" | "f32" | "fp32" => Ok(Precision::Float),
            "half" | "f16" | "fp16" => Ok(Precision::Half),
            other => Err(format!(
                "invalid precision '{other}'; expected 'float' or 'half'"
            )),
        }
    }
}

/// Autotuner preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningSettings {
    pub mode: TuningMode,
    /// Table read in `tuned` mode and written after `tuning`/`tuner_in_process`.
    pub table_path: Option<PathBuf>,
    /// Launches at the default geometry before any candidate is timed.
    pub warmup_runs: u32,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            mode: TuningMode::Disabled,
            table_path: None,
            warmup_runs: 1,
        }
    }
}

/// GPU device preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GpuSettings {
    /// Whether a GPU adapter should be requested at all.
    pub enabled: bool,
    /// Let `WGPU_BACKEND` and friends pick the adapter.
    pub respect_env: bool,
    /// Cap on device memory handed out by the buffer pool, in MiB.
    pub memory_limit_mb: Option<u64>,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            memory_limit_mb: None,
        }
    }
}

impl GpuSettings {
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb * 1024 * 1024)
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

/// Telemetry and diagnostics preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string, falling back to `Debug`.
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(self.level.trim()).unwrap_or(LevelFilter::Debug)
    }
}

/// Everything a network is configured with at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    pub device: DeviceType,
    /// Worker threads for the CPU backend. `0` lets the pool pick.
    pub num_threads: usize,
    /// Channel block the GPU layout pads to.
    pub channel_block_size: usize,
    pub precision: Precision,
    /// Fold absorbable successors into their predecessor's kernel.
    pub fusion: bool,
    /// Recycle intermediate buffers once their last reader has run.
    pub reuse_buffers: bool,
    pub tuning: TuningSettings,
    pub gpu: GpuSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            device: DeviceType::Cpu,
            num_threads: 0,
            channel_block_size: 4,
            precision: Precision::Float,
            fusion: true,
            reuse_buffers: true,
            tuning: TuningSettings::default(),
            gpu: GpuSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl RuntimeSettings {
    /// Read a JSON settings file; missing fields take their defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read runtime settings {}", path.display()))?;
        let mut settings: RuntimeSettings = serde_json::from_str(&text)
            .with_context(|| format!("invalid runtime settings in {}", path.display()))?;
        if settings.channel_block_size == 0 {
            settings.channel_block_size = RuntimeSettings::default().channel_block_size;
        }
        Ok(settings)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("cannot encode runtime settings")?;
        fs::write(path, json)
            .with_context(|| format!("cannot write runtime settings {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let mut settings = RuntimeSettings::default();
        settings.device = DeviceType::GpuBuffer;
        settings.tuning.mode = TuningMode::Tuned;
        settings.tuning.table_path = Some(PathBuf::from("tables/net.json"));
        settings.save_to_path(file.path()).expect("save");

        let loaded = RuntimeSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "device": "gpu_buffer",
            "channel_block_size": 0,
            "tuning": { "mode": "tuner_in_process" }
        }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = RuntimeSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.device, DeviceType::GpuBuffer);
        assert_eq!(loaded.channel_block_size, 4);
        assert_eq!(loaded.tuning.mode, TuningMode::TunerInProcess);
        assert_eq!(loaded.tuning.warmup_runs, 1);
        assert!(loaded.fusion);
        assert!(loaded.reuse_buffers);
        assert_eq!(loaded.telemetry.level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn enums_parse_cli_spellings() {
        assert_eq!("GPU".parse::<DeviceType>(), Ok(DeviceType::GpuBuffer));
        assert_eq!("gpu-image".parse::<DeviceType>(), Ok(DeviceType::GpuImage));
        assert_eq!(
            "tuner-in-process".parse::<TuningMode>(),
            Ok(TuningMode::TunerInProcess)
        );
        assert_eq!("fp16".parse::<Precision>(), Ok(Precision::Half));
        assert!("tpu".parse::<DeviceType>().is_err());
        assert_eq!(TuningMode::TunerInProcess.to_string(), "tuner_in_process");
        assert_eq!(Precision::Half.data_type(), "half");
    }

    #[test]
    fn telemetry_level_parses_variants() {
        let telemetry = TelemetrySettings {
            level: "TRACE".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Trace);

        let telemetry = TelemetrySettings {
            level: "nonsense".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn memory_limit_converts_to_bytes() {
        let gpu = GpuSettings {
            memory_limit_mb: Some(2),
            ..GpuSettings::default()
        };
        assert_eq!(gpu.memory_limit_bytes(), Some(2 * 1024 * 1024));
        let options = GpuContextOptions::from(&gpu);
        assert!(options.enabled);
    }
}
