mod args;
mod config;

use std::{
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use feather_core::{ModelWeights, Net, NetConfig};
use feather_utils::init_logging;
use log::{info, warn};
use serde::Serialize;

use crate::args::{Cli, Command, InspectArgs, ModelArgs, RunArgs};
use crate::config::{apply_cli_overrides, load_settings};

#[derive(Debug, Serialize)]
struct BlobRecord {
    name: String,
    shape: [usize; 4],
    data: Vec<f32>,
}

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(&args),
        Command::Inspect(args) => inspect(&args),
    }
}

fn build_net(args: &ModelArgs) -> Result<Net> {
    let mut settings = load_settings(args.config.as_deref())?;
    apply_cli_overrides(&mut settings, args);

    info!(
        "Creating net on {} (fusion {}, buffer reuse {}, tuning {})",
        settings.device, settings.fusion, settings.reuse_buffers, settings.tuning.mode
    );
    let mut net = Net::new(NetConfig::from_settings(&settings))?;

    net.load_param_path(&args.param)
        .with_context(|| format!("failed to load parameters from {}", args.param.display()))?;
    match args.weights.as_ref() {
        Some(path) => net
            .load_weights_path(path)
            .with_context(|| format!("failed to load weights from {}", path.display()))?,
        None => net.load_weights(&ModelWeights::new())?,
    }
    Ok(net)
}

fn run(args: &RunArgs) -> Result<()> {
    if args.iterations == 0 {
        bail!("--iterations must be at least 1");
    }
    let mut net = build_net(&args.model)?;

    let input_name = match args.input_name.as_ref() {
        Some(name) => name.clone(),
        None => {
            let graph = net.graph();
            match graph.inputs() {
                [only] => graph
                    .input_name(*only)
                    .unwrap_or_else(|| graph.blob(*only).name())
                    .to_string(),
                inputs => bail!(
                    "model has {} inputs; pick one with --input-name",
                    inputs.len()
                ),
            }
        }
    };

    let size = net.get_blob_data_size(&input_name)?;
    let values = match args.input.as_ref() {
        Some(path) => read_input(path)?,
        None => {
            warn!("No --input given; feeding {size} zeros to '{input_name}'");
            vec![0.0; size]
        }
    };
    net.set_input(&input_name, &values)?;

    for iteration in 0..args.iterations {
        net.forward()
            .with_context(|| format!("forward pass {} failed", iteration + 1))?;
    }
    info!(
        "Ran {} forward pass(es) over {} layer(s)",
        args.iterations,
        net.node_count()
    );

    if net.tuning_mode().records() {
        match net.save_tuning_table(None) {
            Ok(path) => info!("Tuning table written to {}", path.display()),
            Err(err) => warn!("Tuning table not saved: {err}"),
        }
    }

    let names: Vec<String> = if args.blobs.is_empty() {
        let graph = net.graph();
        graph
            .outputs()
            .into_iter()
            .map(|id| graph.blob(id).name().to_string())
            .collect()
    } else {
        args.blobs.clone()
    };

    match args.json.as_ref() {
        Some(json_path) => {
            let mut records = Vec::with_capacity(names.len());
            for name in &names {
                let shape = net.blob_shape(name)?;
                records.push(BlobRecord {
                    name: name.clone(),
                    shape: [shape.num, shape.channels, shape.height, shape.width],
                    data: net.extract_blob(name)?,
                });
            }
            write_json(json_path, &records)?;
        }
        None => {
            for name in &names {
                net.print_blob_data(name)?;
            }
        }
    }

    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let net = build_net(&args.model)?;
    let graph = net.graph();
    for (_, node) in graph.live_nodes() {
        let bottoms: Vec<&str> = node
            .bottoms
            .iter()
            .map(|&id| graph.blob(id).name())
            .collect();
        let top = graph.blob(node.top);
        println!(
            "{:<16} {:<14} [{}] -> {} {}",
            node.name,
            node.layer.type_name(),
            bottoms.join(", "),
            top.name(),
            top.shape()
        );
    }
    Ok(())
}

/// Input values from a JSON array, or from raw little-endian f32 otherwise.
fn read_input(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        return serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {} as a JSON array", path.display()));
    }
    if bytes.len() % 4 != 0 {
        bail!(
            "{} holds {} bytes, not a whole number of f32 values",
            path.display(),
            bytes.len()
        );
    }
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

fn write_json(json_path: &Path, records: &[BlobRecord]) -> Result<()> {
    if let Some(dir) = json_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let file = File::create(json_path)
        .with_context(|| format!("failed to create {}", json_path.display()))?;
    serde_json::to_writer_pretty(file, records)
        .with_context(|| format!("failed to write blob JSON to {}", json_path.display()))?;
    info!("Wrote {} blob(s) to {}", records.len(), json_path.display());
    Ok(())
}
