//! Settings loading and command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use feather_utils::RuntimeSettings;
use log::info;

use crate::args::ModelArgs;

/// Load settings from a file or fall back to defaults.
pub fn load_settings(config_path: Option<&Path>) -> Result<RuntimeSettings> {
    match config_path {
        Some(path) => {
            let settings = RuntimeSettings::load_from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?;
            info!("Loaded settings from {}", path.display());
            Ok(settings)
        }
        None => Ok(RuntimeSettings::default()),
    }
}

/// Apply command-line flags on top of loaded or default settings.
pub fn apply_cli_overrides(settings: &mut RuntimeSettings, args: &ModelArgs) {
    if let Some(device) = args.device {
        settings.device = device;
    }
    if let Some(threads) = args.threads {
        settings.num_threads = threads;
    }
    if let Some(precision) = args.precision {
        settings.precision = precision;
    }
    if args.no_fusion {
        settings.fusion = false;
    }
    if args.no_reuse {
        settings.reuse_buffers = false;
    }
    if let Some(mode) = args.tuning_mode {
        settings.tuning.mode = mode;
    }
    if let Some(path) = args.tuning_table.as_ref() {
        settings.tuning.table_path = Some(path.clone());
    }
    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        let lower = level.trim().to_ascii_lowercase();
        if !lower.is_empty() {
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
            settings.telemetry.level = lower;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use feather_utils::{DeviceType, TuningMode};

    use crate::args::{Cli, Command};

    fn model_args(argv: &[&str]) -> ModelArgs {
        let cli = Cli::try_parse_from(argv).expect("parse");
        match cli.command {
            Command::Run(run) => run.model,
            Command::Inspect(inspect) => inspect.model,
        }
    }

    #[test]
    fn flags_override_settings() {
        let args = model_args(&[
            "feather",
            "run",
            "--param",
            "net.json",
            "--device",
            "gpu_buffer",
            "--no-fusion",
            "--tuning",
            "tuned",
            "--tuning-table",
            "table.json",
            "--telemetry-level",
            "OFF",
        ]);
        let mut settings = RuntimeSettings::default();
        settings.telemetry.enabled = true;
        apply_cli_overrides(&mut settings, &args);

        assert_eq!(settings.device, DeviceType::GpuBuffer);
        assert!(!settings.fusion);
        assert!(settings.reuse_buffers);
        assert_eq!(settings.tuning.mode, TuningMode::Tuned);
        assert_eq!(
            settings.tuning.table_path.as_deref(),
            Some(Path::new("table.json"))
        );
        assert!(!settings.telemetry.enabled);
        assert_eq!(settings.telemetry.level, "off");
    }

    #[test]
    fn absent_flags_keep_settings() {
        let args = model_args(&["feather", "inspect", "--param", "net.json"]);
        let mut settings = RuntimeSettings::default();
        settings.num_threads = 3;
        apply_cli_overrides(&mut settings, &args);

        let mut expected = RuntimeSettings::default();
        expected.num_threads = 3;
        assert_eq!(settings, expected);
    }
}
