//! Compute device acquisition on top of `wgpu`.
//!
//! A [`GpuContext`] is a device and queue opened for compute only: no surface
//! and the adapter's full limits. Callers that can run without a GPU go through
//! [`GpuContext::init_with_fallback`] and inspect the [`GpuAvailability`].

pub mod buffer_pool;
pub use buffer_pool::{BufferPoolError, GpuBufferPool};

use std::sync::Arc;

use log::{debug, info, warn};
use pollster::block_on;
use thiserror::Error;
use wgpu::{
    AdapterInfo, Backends, Device, DeviceDescriptor, ExperimentalFeatures, Features, Instance,
    InstanceDescriptor, Limits, MemoryHints, PowerPreference, Queue, RequestAdapterError,
    RequestAdapterOptions, RequestDeviceError, Trace,
};

/// How to pick and open a compute adapter.
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    pub enabled: bool,
    /// Let `WGPU_BACKEND` and the other `WGPU_*` variables override the fields below.
    pub respect_env: bool,
    pub backends: Backends,
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    /// Enable `SHADER_F16` when the adapter has it.
    pub request_f16: bool,
    pub label: String,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            request_f16: true,
            label: "feather compute".to_string(),
        }
    }
}

impl GpuContextOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Launch limits of the opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeLimits {
    /// `max_compute_invocations_per_workgroup`
    pub max_invocations: u32,
    /// `max_compute_workgroup_size_{x,y,z}`
    pub max_size: [u32; 3],
    /// `max_compute_workgroups_per_dimension`
    pub max_groups_per_dim: u32,
    /// Largest storage buffer a single binding may cover, in bytes.
    pub max_storage_binding: u64,
}

impl From<&Limits> for ComputeLimits {
    fn from(limits: &Limits) -> Self {
        Self {
            max_invocations: limits.max_compute_invocations_per_workgroup,
            max_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_groups_per_dim: limits.max_compute_workgroups_per_dimension,
            max_storage_binding: u64::from(limits.max_storage_buffer_binding_size),
        }
    }
}

/// Outcome of asking for a GPU.
#[derive(Debug)]
pub enum GpuAvailability {
    Available(Arc<GpuContext>),
    /// Turned off by configuration.
    Disabled { reason: String },
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Device and queue shared by every kernel of one runtime.
#[derive(Debug)]
pub struct GpuContext {
    device: Device,
    queue: Queue,
    info: AdapterInfo,
    features: Features,
    limits: ComputeLimits,
}

impl GpuContext {
    /// Open a compute device, failing with the reason when none fits `options`.
    pub fn open(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }

        let mut descriptor = if options.respect_env {
            InstanceDescriptor::from_env_or_default()
        } else {
            InstanceDescriptor::default()
        };
        descriptor.backends = if options.respect_env {
            options.backends.with_env()
        } else {
            options.backends
        };
        let backends = descriptor.backends;
        let instance = Instance::new(&descriptor);

        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let info = adapter.get_info();
        let features = if options.request_f16 {
            adapter.features() & Features::SHADER_F16
        } else {
            Features::empty()
        };
        if options.request_f16 && features.is_empty() {
            debug!(target: "feather::gpu", "adapter '{}' has no SHADER_F16", info.name);
        }
        let limits = adapter.limits();

        let (device, queue) = block_on(adapter.request_device(&DeviceDescriptor {
            label: Some(&options.label),
            required_features: features,
            required_limits: limits.clone(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: MemoryHints::Performance,
            trace: Trace::default(),
        }))?;

        let limits = ComputeLimits::from(&limits);
        info!(
            target: "feather::gpu",
            "opened '{}' ({:?}/{:?}), work groups up to {} invocations",
            info.name, info.backend, info.device_type, limits.max_invocations
        );

        Ok(Self {
            device,
            queue,
            info,
            features,
            limits,
        })
    }

    /// Open a device if possible, reporting why not instead of failing.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        match Self::open(options) {
            Ok(context) => GpuAvailability::Available(Arc::new(context)),
            Err(GpuInitError::Disabled) => GpuAvailability::Disabled {
                reason: "GPU backend disabled via configuration".to_string(),
            },
            Err(error) => {
                warn!(target: "feather::gpu", "no usable GPU: {error}");
                GpuAvailability::Unavailable { error }
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Whether kernels may declare `enable f16;`.
    pub fn supports_f16(&self) -> bool {
        self.features.contains(Features::SHADER_F16)
    }

    pub fn limits(&self) -> ComputeLimits {
        self.limits
    }
}

#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("no GPU adapter for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error("GPU device request failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU backend disabled")]
    Disabled,
}
