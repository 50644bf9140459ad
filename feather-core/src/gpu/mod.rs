//! GPU kernel runtime built on `wgpu` compute.
//!
//! One [`GpuRuntime`] belongs to one net. It owns the device handles, the
//! device buffer pool, the compiled-program cache and the autotuner, and it is
//! the only path through which layers touch the device.

pub mod buffer;
pub mod kernel;
pub mod kernels;
pub mod program;

pub use buffer::DeviceBuffer;
pub use kernel::{Kernel, KernelArg, KernelInfo, fine_tune_group_size};
pub use program::{BuildOptions, Program, ProgramKey};

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use bytemuck::{Pod, cast_slice};
use feather_utils::gpu::{GpuAvailability, GpuBufferPool, GpuContext, GpuContextOptions};
use feather_utils::{GpuSettings, Precision};
use log::{debug, warn};
use pollster::block_on;

use self::buffer::{create_uniform_buffer, read_buffer, readback_usage};
use self::program::lock;
use crate::error::{GpuError, LayerError};
use crate::tuner::{Tuner, WorkGroupLimits};

/// Device context, program cache and tuner for one net.
pub struct GpuRuntime {
    context: Arc<GpuContext>,
    pool: Arc<GpuBufferPool>,
    precision: Precision,
    channel_block_size: usize,
    programs: Mutex<HashMap<ProgramKey, Arc<Program>>>,
    tuner: Mutex<Tuner>,
}

impl GpuRuntime {
    /// Wrap an existing context.
    ///
    /// Half precision silently falls back to float when the device lacks
    /// `SHADER_F16`.
    pub fn new(
        context: Arc<GpuContext>,
        precision: Precision,
        channel_block_size: usize,
        memory_limit: Option<u64>,
        tuner: Tuner,
    ) -> Self {
        let precision = match precision {
            Precision::Half if !context.supports_f16() => {
                warn!(
                    target: "feather::gpu",
                    "adapter '{}' lacks SHADER_F16; falling back to float kernels",
                    context.adapter_info().name
                );
                Precision::Float
            }
            other => other,
        };
        let pool = Arc::new(GpuBufferPool::new(Arc::clone(&context), memory_limit));
        Self {
            context,
            pool,
            precision,
            channel_block_size: channel_block_size.max(1),
            programs: Mutex::new(HashMap::new()),
            tuner: Mutex::new(tuner),
        }
    }

    /// Request a device according to `settings`.
    pub fn from_settings(
        settings: &GpuSettings,
        precision: Precision,
        channel_block_size: usize,
        tuner: Tuner,
    ) -> Result<Self, GpuError> {
        match GpuContext::init_with_fallback(&GpuContextOptions::from(settings)) {
            GpuAvailability::Available(context) => Ok(Self::new(
                context,
                precision,
                channel_block_size,
                settings.memory_limit_bytes(),
                tuner,
            )),
            GpuAvailability::Disabled { reason } => Err(GpuError::Unavailable(reason)),
            GpuAvailability::Unavailable { error } => Err(GpuError::Unavailable(error.to_string())),
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn channel_block_size(&self) -> usize {
        self.channel_block_size
    }

    pub fn buffer_pool(&self) -> &Arc<GpuBufferPool> {
        &self.pool
    }

    pub fn limits(&self) -> WorkGroupLimits {
        let limits = self.context.limits();
        WorkGroupLimits {
            max_work_group_size: limits.max_invocations,
            axis_limits: limits.max_size,
        }
    }

    /// Default local work size for `gws` on this device.
    pub fn fine_tune_group_size(&self, gws: [u32; 3]) -> [u32; 3] {
        self.limits().default_lws(gws)
    }

    /// Options every program is compiled with, before layer-specific defines.
    pub fn base_options(&self) -> BuildOptions {
        BuildOptions::new()
            .define_value("DATA_TYPE", self.precision.data_type())
            .define_value("N", self.channel_block_size)
    }

    /// Compile `name` under `options`, reusing an earlier identical build.
    pub fn build_program(&self, name: &str, options: &BuildOptions) -> Result<Arc<Program>, GpuError> {
        let key = ProgramKey {
            name: name.to_string(),
            options: options.clone(),
        };
        if let Some(program) = lock(&self.programs).get(&key) {
            return Ok(Arc::clone(program));
        }
        let source = kernels::lookup(name).ok_or_else(|| GpuError::UnknownProgram(name.to_string()))?;
        let program = Arc::new(Program::compile(
            self.context.device(),
            source,
            options,
            self.context.supports_f16(),
        )?);
        lock(&self.programs).insert(key, Arc::clone(&program));
        Ok(program)
    }

    /// Number of distinct compiled programs.
    pub fn program_count(&self) -> usize {
        lock(&self.programs).len()
    }

    /// Compile the program behind `info` and attach its entry point.
    pub fn build_kernel(&self, info: &mut KernelInfo) -> Result<(), GpuError> {
        let program = self.build_program(&info.program_name, &info.build_options)?;
        let entry = program.entry(&info.kernel_name).ok_or_else(|| GpuError::Compile {
            program: info.program_name.clone(),
            options: info.build_options.to_string(),
            log: format!("no entry point named '{}'", info.kernel_name),
        })?;
        let layout = program.layout(self.context.device(), entry);
        info.lws = self.fine_tune_group_size(info.gws);
        info.attach(Kernel {
            program,
            entry,
            layout,
        });
        Ok(())
    }

    /// Create the bind group for a kernel whose arguments are all set.
    pub fn bind_args(&self, info: &mut KernelInfo) -> Result<(), GpuError> {
        let kernel = info
            .kernel
            .as_ref()
            .ok_or_else(|| GpuError::KernelNotBuilt(info.kernel_name.clone()))?;
        if let Some(index) = info.first_unbound() {
            return Err(GpuError::ArgBinding {
                kernel: info.kernel_name.clone(),
                index,
                reason: "argument was never set".into(),
            });
        }
        let entries: Vec<wgpu::BindGroupEntry<'_>> = info
            .bound_args()
            .map(|(index, arg)| wgpu::BindGroupEntry {
                binding: index as u32,
                resource: match arg {
                    KernelArg::Storage(buffer) | KernelArg::Uniform(buffer) => {
                        buffer.as_entire_binding()
                    }
                },
            })
            .collect();

        let device = self.context.device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&info.kernel_name),
            layout: &kernel.layout,
            entries: &entries,
        });
        drop(entries);
        if let Some(error) = block_on(device.pop_error_scope()) {
            return Err(GpuError::Launch {
                kernel: info.kernel_name.clone(),
                reason: format!("bind group rejected: {error}"),
            });
        }
        info.bind_group = Some(bind_group);
        Ok(())
    }

    /// Enqueue one launch of `info` at local size `lws`. Does not wait.
    pub fn enqueue(&self, info: &KernelInfo, lws: [u32; 3]) -> Result<(), GpuError> {
        let kernel = info
            .kernel
            .as_ref()
            .ok_or_else(|| GpuError::KernelNotBuilt(info.kernel_name.clone()))?;
        let bind_group = info.bind_group.as_ref().ok_or_else(|| GpuError::ArgBinding {
            kernel: info.kernel_name.clone(),
            index: info.first_unbound().unwrap_or(0),
            reason: "arguments were not bound".into(),
        })?;
        let device = self.context.device();
        let pipeline = kernel.program.pipeline(device, kernel.entry, lws)?;

        let max_groups = self.context.limits().max_groups_per_dim;
        let mut groups = [0u32; 3];
        for axis in 0..3 {
            groups[axis] = info.gws[axis].div_ceil(lws[axis].max(1));
            if groups[axis] > max_groups {
                return Err(GpuError::Launch {
                    kernel: info.kernel_name.clone(),
                    reason: format!(
                        "{} work groups on axis {axis} exceed the device limit {max_groups}",
                        groups[axis]
                    ),
                });
            }
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&info.kernel_name),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&info.kernel_name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.context.queue().submit(Some(encoder.finish()));
        if let Some(error) = block_on(device.pop_error_scope()) {
            return Err(GpuError::Launch {
                kernel: info.kernel_name.clone(),
                reason: error.to_string(),
            });
        }
        Ok(())
    }

    /// Block until every submitted command has completed.
    pub fn finish(&self) -> Result<(), GpuError> {
        self.context
            .device()
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| GpuError::Sync(e.to_string()))
    }

    /// One synchronized, timed launch. Pipeline creation happens before the clock starts.
    fn measure(&self, info: &KernelInfo, lws: [u32; 3]) -> Result<f64, GpuError> {
        if let Some(kernel) = &info.kernel {
            kernel.program.pipeline(self.context.device(), kernel.entry, lws)?;
        }
        self.finish()?;
        let start = Instant::now();
        self.enqueue(info, lws)?;
        self.finish()?;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Launch `info` for `layer`, letting the tuner choose the local size.
    pub fn run_kernel(&self, layer: &str, info: &mut KernelInfo) -> Result<(), LayerError> {
        let geometry = {
            let mut tuner = self.tuner();
            let limits = self.limits();
            let snapshot: &KernelInfo = info;
            tuner.select::<LayerError, _>(layer, &snapshot.kernel_name, snapshot.gws, limits, |lws| {
                Ok(self.measure(snapshot, lws)?)
            })?
        };
        info.lws = geometry.lws;
        self.enqueue(info, geometry.lws)?;
        Ok(())
    }

    pub fn tuner(&self) -> MutexGuard<'_, Tuner> {
        lock(&self.tuner)
    }

    /// Allocate pooled device storage for `elements` values. Contents are undefined.
    pub fn alloc_buffer(&self, elements: usize, label: &str) -> Result<DeviceBuffer, GpuError> {
        DeviceBuffer::acquire(&self.pool, elements, label)
    }

    /// Allocate device storage and fill it with `data`.
    pub fn upload(&self, data: &[f32], label: &str) -> Result<DeviceBuffer, GpuError> {
        let buffer = self.alloc_buffer(data.len(), label)?;
        self.write_buffer(&buffer, data);
        Ok(buffer)
    }

    pub fn write_buffer(&self, buffer: &DeviceBuffer, data: &[f32]) {
        if !data.is_empty() {
            self.context
                .queue()
                .write_buffer(buffer.buffer(), 0, cast_slice(data));
        }
    }

    /// Uniform argument holding `data`.
    pub fn uniform<T: Pod>(&self, label: &str, data: &T) -> KernelArg {
        KernelArg::Uniform(create_uniform_buffer(self.context.device(), label, data))
    }

    /// Copy the first `elements` values of `buffer` back to the host.
    ///
    /// Waits for every launch already enqueued.
    pub fn read_buffer(&self, buffer: &DeviceBuffer, elements: usize) -> Result<Vec<f32>, GpuError> {
        let elements = elements.min(buffer.elements());
        let size_bytes = (elements.max(1) * std::mem::size_of::<f32>()) as u64;
        let usage = readback_usage();
        let staging = self.pool.acquire(size_bytes, usage, Some("feather_readback"))?;

        let device = self.context.device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("feather_readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(buffer.buffer(), 0, &staging, 0, size_bytes);
        self.context.queue().submit(Some(encoder.finish()));

        let result = read_buffer(device, &staging, elements);
        self.pool.recycle(staging, size_bytes, usage);
        debug!(target: "feather::gpu", "read back {elements} values");
        result
    }
}

impl fmt::Debug for GpuRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuRuntime")
            .field("adapter", &self.context.adapter_info().name)
            .field("precision", &self.precision)
            .field("channel_block_size", &self.channel_block_size)
            .field("programs", &self.program_count())
            .field("pool", &self.pool)
            .finish()
    }
}
