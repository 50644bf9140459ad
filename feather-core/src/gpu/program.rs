//! Program compilation and the per-program pipeline cache.
//!
//! A program is one WGSL source compiled under a set of build options. The
//! options use `-DNAME[=VALUE]` syntax. `DATA_TYPE` selects the arithmetic type
//! through a generated alias, and every other define feeds the pipeline
//! override of the same name when the source declares one.

use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex},
};

use log::{debug, trace, warn};
use pollster::block_on;

use super::buffer::buffer_entry;
use super::kernels::{ArgKind, KernelEntry, KernelSource};
use crate::error::GpuError;

/// Overrides every kernel declares for its work-group size.
const WORK_GROUP_OVERRIDES: [&str; 3] = ["WG_X", "WG_Y", "WG_Z"];

/// Sorted set of `-D` defines. Ordering never affects equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildOptions {
    defines: BTreeMap<String, Option<String>>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space separated option string such as `-DDATA_TYPE=float -DUSE_RELU`.
    pub fn parse(options: &str) -> Result<Self, GpuError> {
        let mut parsed = Self::new();
        for token in options.split_whitespace() {
            let Some(define) = token.strip_prefix("-D") else {
                return Err(GpuError::Compile {
                    program: String::new(),
                    options: options.to_string(),
                    log: format!("unsupported build option '{token}'"),
                });
            };
            match define.split_once('=') {
                Some((name, value)) => parsed.insert(name, Some(value.to_string())),
                None => parsed.insert(define, None),
            };
        }
        Ok(parsed)
    }

    /// Add `-DNAME`.
    pub fn define(mut self, name: &str) -> Self {
        self.insert(name, None);
        self
    }

    /// Add `-DNAME=VALUE`.
    pub fn define_value(mut self, name: &str, value: impl ToString) -> Self {
        self.insert(name, Some(value.to_string()));
        self
    }

    /// Add `-DNAME` only when `enabled`.
    pub fn define_if(self, name: &str, enabled: bool) -> Self {
        if enabled { self.define(name) } else { self }
    }

    pub fn insert(&mut self, name: &str, value: Option<String>) -> &mut Self {
        self.defines.insert(name.to_string(), value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines.get(name).and_then(|v| v.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.defines {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match value {
                Some(value) => write!(f, "-D{name}={value}")?,
                None => write!(f, "-D{name}")?,
            }
        }
        Ok(())
    }
}

/// Cache key for compiled programs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub name: String,
    pub options: BuildOptions,
}

/// A compiled program plus the pipelines created from it.
pub struct Program {
    name: String,
    options: BuildOptions,
    source: &'static KernelSource,
    module: wgpu::ShaderModule,
    constants: Vec<(String, f64)>,
    layouts: Mutex<HashMap<&'static str, Arc<wgpu::BindGroupLayout>>>,
    pipelines: Mutex<HashMap<(&'static str, [u32; 3]), Arc<wgpu::ComputePipeline>>>,
}

impl Program {
    /// Compile `source` under `options`, capturing the compiler log on failure.
    pub(crate) fn compile(
        device: &wgpu::Device,
        source: &'static KernelSource,
        options: &BuildOptions,
        f16: bool,
    ) -> Result<Self, GpuError> {
        let compile_error = |log: String| GpuError::Compile {
            program: source.program.to_string(),
            options: options.to_string(),
            log,
        };

        let prelude = data_type_prelude(options.value("DATA_TYPE").unwrap_or("float"), f16)
            .map_err(compile_error)?;
        let declared = declared_overrides(source.source);
        let constants = override_constants(options, &declared).map_err(compile_error)?;
        let text = format!("{prelude}{}", source.source);

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.program),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(text)),
        });
        let scope_error = block_on(device.pop_error_scope());
        let info = block_on(module.get_compilation_info());

        let mut log = String::new();
        let mut failed = scope_error.is_some();
        for message in &info.messages {
            if matches!(message.message_type, wgpu::CompilationMessageType::Error) {
                failed = true;
            }
            let line = message
                .location
                .as_ref()
                .map(|loc| format!("{}:{}: ", loc.line_number, loc.line_position))
                .unwrap_or_default();
            log.push_str(&format!(
                "{:?}: {line}{}\n",
                message.message_type, message.message
            ));
        }
        if let Some(error) = scope_error {
            log.push_str(&error.to_string());
        }
        if failed {
            return Err(compile_error(log));
        }
        if !log.is_empty() {
            warn!(target: "feather::gpu", "program '{}' compiled with messages:\n{log}", source.program);
        }
        debug!(
            target: "feather::gpu",
            "compiled program '{}' [{}]",
            source.program, options
        );

        Ok(Self {
            name: source.program.to_string(),
            options: options.clone(),
            source,
            module,
            constants,
            layouts: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Look up an entry point declared for this program.
    pub fn entry(&self, name: &str) -> Option<&'static KernelEntry> {
        self.source.entries.iter().find(|entry| entry.name == name)
    }

    /// Bind-group layout for `entry`, created once.
    pub(crate) fn layout(
        &self,
        device: &wgpu::Device,
        entry: &'static KernelEntry,
    ) -> Arc<wgpu::BindGroupLayout> {
        let mut layouts = lock(&self.layouts);
        Arc::clone(layouts.entry(entry.name).or_insert_with(|| {
            let entries: Vec<_> = entry
                .args
                .iter()
                .enumerate()
                .map(|(index, kind)| {
                    let ty = match kind {
                        ArgKind::ReadOnly => {
                            wgpu::BufferBindingType::Storage { read_only: true }
                        }
                        ArgKind::ReadWrite => {
                            wgpu::BufferBindingType::Storage { read_only: false }
                        }
                        ArgKind::Uniform => wgpu::BufferBindingType::Uniform,
                    };
                    buffer_entry(index as u32, ty)
                })
                .collect();
            Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(entry.name),
                entries: &entries,
            }))
        }))
    }

    /// Compute pipeline for `entry` at work-group size `lws`, created once per size.
    pub(crate) fn pipeline(
        &self,
        device: &wgpu::Device,
        entry: &'static KernelEntry,
        lws: [u32; 3],
    ) -> Result<Arc<wgpu::ComputePipeline>, GpuError> {
        if let Some(pipeline) = lock(&self.pipelines).get(&(entry.name, lws)) {
            return Ok(Arc::clone(pipeline));
        }

        let layout = self.layout(device, entry);
        let mut constants: Vec<(&str, f64)> = self
            .constants
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        for (name, size) in WORK_GROUP_OVERRIDES.iter().zip(lws) {
            constants.push((*name, f64::from(size)));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry.name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry.name),
            layout: Some(&pipeline_layout),
            module: &self.module,
            entry_point: Some(entry.name),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        if let Some(error) = block_on(device.pop_error_scope()) {
            return Err(GpuError::Compile {
                program: self.name.clone(),
                options: format!("{} (entry {}, lws {lws:?})", self.options, entry.name),
                log: error.to_string(),
            });
        }
        trace!(
            target: "feather::gpu",
            "created pipeline {}::{} for lws {lws:?}",
            self.name, entry.name
        );

        let pipeline = Arc::new(pipeline);
        lock(&self.pipelines).insert((entry.name, lws), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Number of pipelines created so far.
    pub fn pipeline_count(&self) -> usize {
        lock(&self.pipelines).len()
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("options", &self.options.to_string())
            .field("pipelines", &self.pipeline_count())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Source text placed before every program to define `DATA_TYPE`.
fn data_type_prelude(data_type: &str, f16: bool) -> Result<String, String> {
    match data_type {
        "float" => Ok("alias DATA_TYPE = f32;\n".to_string()),
        "half" if f16 => {
            Ok("enable f16;\nalias DATA_TYPE = f16;\n".to_string())
        }
        "half" => Err("DATA_TYPE=half requires the SHADER_F16 device feature".to_string()),
        other => Err(format!("unsupported DATA_TYPE '{other}'")),
    }
}

/// Names declared with `override` at module scope.
pub(crate) fn declared_overrides(source: &str) -> BTreeSet<String> {
    source
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("override "))
        .filter_map(|rest| {
            let name: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            (!name.is_empty()).then_some(name)
        })
        .collect()
}

/// Pipeline constants for every define the source declares as an override.
fn override_constants(
    options: &BuildOptions,
    declared: &BTreeSet<String>,
) -> Result<Vec<(String, f64)>, String> {
    let mut constants = Vec::new();
    for (name, value) in &options.defines {
        if name == "DATA_TYPE" || WORK_GROUP_OVERRIDES.contains(&name.as_str()) {
            continue;
        }
        if !declared.contains(name) {
            trace!(target: "feather::gpu", "define {name} is not used by this program");
            continue;
        }
        let numeric = match value.as_deref() {
            None | Some("true") => 1.0,
            Some("false") => 0.0,
            Some(text) => text
                .parse::<f64>()
                .map_err(|_| format!("override {name} expects a numeric value, got '{text}'"))?,
        };
        constants.push((name.clone(), numeric));
    }
    Ok(constants)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_order_independent() {
        let a = BuildOptions::parse("-DUSE_RELU -DDATA_TYPE=float -DN=4").expect("parse");
        let b = BuildOptions::new()
            .define_value("N", 4)
            .define_value("DATA_TYPE", "float")
            .define("USE_RELU");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "-DDATA_TYPE=float -DN=4 -DUSE_RELU");
        assert_eq!(a.value("N"), Some("4"));
    }

    #[test]
    fn rejects_non_define_options() {
        assert!(matches!(
            BuildOptions::parse("-cl-fast-relaxed-math"),
            Err(GpuError::Compile { .. })
        ));
    }

    #[test]
    fn finds_declared_overrides() {
        let src = "override WG_X: u32 = 1u;\n  override USE_RELU: u32 = 0u;\nconst K = 2u;\n";
        let declared = declared_overrides(src);
        assert!(declared.contains("WG_X"));
        assert!(declared.contains("USE_RELU"));
        assert!(!declared.contains("K"));
    }

    #[test]
    fn only_declared_defines_become_constants() {
        let options = BuildOptions::new()
            .define("USE_RELU")
            .define("UNUSED")
            .define_value("OPERATION", 2)
            .define_value("DATA_TYPE", "float");
        let declared: BTreeSet<String> = ["USE_RELU", "OPERATION"]
            .into_iter()
            .map(String::from)
            .collect();
        let constants = override_constants(&options, &declared).expect("numeric");
        assert_eq!(
            constants,
            vec![("OPERATION".to_string(), 2.0), ("USE_RELU".to_string(), 1.0)]
        );

        let bad = BuildOptions::new().define_value("OPERATION", "sum");
        assert!(override_constants(&bad, &declared).is_err());
    }

    #[test]
    fn half_precision_requires_device_support() {
        assert!(data_type_prelude("half", false).is_err());
        assert!(
            data_type_prelude("half", true)
                .expect("f16")
                .starts_with("enable f16;")
        );
        assert!(data_type_prelude("double", true).is_err());
    }
}
