//! Per-layer kernel metadata and argument binding.

use std::{fmt, sync::Arc};

use super::buffer::DeviceBuffer;
use super::kernels::{ArgKind, KernelEntry};
use super::program::{BuildOptions, Program};
use crate::error::GpuError;

/// A built entry point: program, signature and bind-group layout.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) program: Arc<Program>,
    pub(crate) entry: &'static KernelEntry,
    pub(crate) layout: Arc<wgpu::BindGroupLayout>,
}

impl Kernel {
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn signature(&self) -> &'static [ArgKind] {
        self.entry.args
    }
}

/// A buffer bound to one kernel argument slot.
#[derive(Clone, Debug)]
pub enum KernelArg {
    Storage(wgpu::Buffer),
    Uniform(wgpu::Buffer),
}

impl KernelArg {
    pub fn storage(buffer: &DeviceBuffer) -> Self {
        KernelArg::Storage(buffer.buffer().clone())
    }

    fn buffer(&self) -> &wgpu::Buffer {
        match self {
            KernelArg::Storage(buffer) | KernelArg::Uniform(buffer) => buffer,
        }
    }
}

/// Launch metadata for one kernel of one layer.
///
/// Created at layer setup, updated by the autotuner, read at every launch.
pub struct KernelInfo {
    pub program_name: String,
    pub kernel_name: String,
    pub build_options: BuildOptions,
    pub gws: [u32; 3],
    pub lws: [u32; 3],
    pub(crate) kernel: Option<Kernel>,
    args: Vec<Option<KernelArg>>,
    pub(crate) bind_group: Option<wgpu::BindGroup>,
}

impl KernelInfo {
    pub fn new(
        program_name: impl Into<String>,
        kernel_name: impl Into<String>,
        build_options: BuildOptions,
        gws: [u32; 3],
    ) -> Self {
        Self {
            program_name: program_name.into(),
            kernel_name: kernel_name.into(),
            build_options,
            gws,
            lws: [1, 1, 1],
            kernel: None,
            args: Vec::new(),
            bind_group: None,
        }
    }

    pub fn is_built(&self) -> bool {
        self.kernel.is_some()
    }

    pub fn kernel(&self) -> Option<&Kernel> {
        self.kernel.as_ref()
    }

    pub(crate) fn attach(&mut self, kernel: Kernel) {
        self.args = vec![None; kernel.entry.args.len()];
        self.kernel = Some(kernel);
        self.bind_group = None;
    }

    /// Bind `arg` to slot `index`, checking it against the kernel signature.
    pub fn set_arg(&mut self, index: usize, arg: KernelArg) -> Result<(), GpuError> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| GpuError::KernelNotBuilt(self.kernel_name.clone()))?;
        let reject = |reason: String| GpuError::ArgBinding {
            kernel: self.kernel_name.clone(),
            index,
            reason,
        };
        let kind = kernel
            .entry
            .args
            .get(index)
            .ok_or_else(|| reject(format!("kernel takes {} arguments", kernel.entry.args.len())))?;
        let usage = arg.buffer().usage();
        match (kind, &arg) {
            (ArgKind::ReadOnly | ArgKind::ReadWrite, KernelArg::Storage(_)) => {
                if !usage.contains(wgpu::BufferUsages::STORAGE) {
                    return Err(reject("buffer lacks STORAGE usage".into()));
                }
            }
            (ArgKind::Uniform, KernelArg::Uniform(_)) => {
                if !usage.contains(wgpu::BufferUsages::UNIFORM) {
                    return Err(reject("buffer lacks UNIFORM usage".into()));
                }
            }
            (expected, _) => {
                return Err(reject(format!("expected a {expected:?} argument")));
            }
        }
        if arg.buffer().size() == 0 {
            return Err(reject("zero-sized buffer".into()));
        }
        self.args[index] = Some(arg);
        self.bind_group = None;
        Ok(())
    }

    /// Index of the first argument slot that is still empty.
    pub fn first_unbound(&self) -> Option<usize> {
        self.args.iter().position(Option::is_none)
    }

    pub(crate) fn bound_args(&self) -> impl Iterator<Item = (usize, &KernelArg)> {
        self.args
            .iter()
            .enumerate()
            .filter_map(|(index, arg)| arg.as_ref().map(|arg| (index, arg)))
    }
}

impl fmt::Debug for KernelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelInfo")
            .field("program", &self.program_name)
            .field("kernel", &self.kernel_name)
            .field("options", &self.build_options.to_string())
            .field("gws", &self.gws)
            .field("lws", &self.lws)
            .field("built", &self.is_built())
            .finish()
    }
}

/// Largest power of two `<= bound` that divides `budget`.
pub(crate) fn pow2_divisor_at_most(bound: u32, budget: u32) -> u32 {
    let mut size = 1u32;
    while size * 2 <= bound && budget % (size * 2) == 0 {
        size *= 2;
    }
    size
}

/// Initial local work size for a problem of extent `gws`.
///
/// Axis 0 gets as much of the work-group budget as the problem can use, later
/// axes share what remains. Every axis is a power of two no larger than the
/// next power of two of its extent or its axis limit, and the product divides
/// `max_work_group_size`.
pub fn fine_tune_group_size(gws: [u32; 3], max_work_group_size: u32, axis_limits: [u32; 3]) -> [u32; 3] {
    let mut lws = [1u32; 3];
    let mut budget = max_work_group_size.max(1);
    for axis in 0..3 {
        let bound = gws[axis]
            .max(1)
            .next_power_of_two()
            .min(axis_limits[axis].max(1))
            .min(budget);
        lws[axis] = pow2_divisor_at_most(bound, budget);
        budget /= lws[axis];
    }
    lws
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fine_tune_respects_every_limit() {
        let limits = [256, 256, 64];
        for gws in [[1, 1, 1], [3, 7, 100], [64, 64, 64], [1000, 1, 1], [5, 300, 2]] {
            let lws = fine_tune_group_size(gws, 256, limits);
            let product: u32 = lws.iter().product();
            assert!(product <= 256);
            assert_eq!(256 % product, 0);
            for axis in 0..3 {
                assert!(lws[axis] <= limits[axis]);
                assert!(lws[axis] <= gws[axis].next_power_of_two());
                assert!(lws[axis].is_power_of_two());
            }
        }
    }

    #[test]
    fn fine_tune_fills_first_axis_first() {
        assert_eq!(fine_tune_group_size([16, 8, 4], 64, [64, 64, 64]), [16, 4, 1]);
        assert_eq!(fine_tune_group_size([3, 3, 3], 256, [256, 256, 64]), [4, 4, 4]);
    }

    #[test]
    fn odd_budgets_still_divide() {
        let lws = fine_tune_group_size([64, 64, 1], 96, [96, 96, 96]);
        let product: u32 = lws.iter().product();
        assert_eq!(96 % product, 0);
        assert_eq!(lws, [32, 1, 1]);
    }
}
