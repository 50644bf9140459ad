use std::any::Any;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use super::{Layer, dim, prepare_kernel, run_all, single_input, single_shape};
use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{GpuRuntime, KernelArg, KernelInfo};
use crate::runtime::CpuContext;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SoftmaxParams {
    channels: u32,
    channels_padded: u32,
    pixels: u32,
    _pad: u32,
}

/// Softmax over every element of the blob.
#[derive(Debug, Default)]
pub struct SoftmaxLayer {
    shape: BlobShape,
    kernels: Vec<KernelInfo>,
}

impl SoftmaxLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for SoftmaxLayer {
    fn type_name(&self) -> &'static str {
        "Softmax"
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        self.shape = single_shape(inputs)?;
        Ok(self.shape)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn forward_cpu(
        &self,
        cpu: &CpuContext,
        inputs: &[&Blob],
        output: &mut Blob,
    ) -> Result<(), LayerError> {
        let src = single_input(inputs)?.data()?;
        let dst = output.data_mut()?;
        if src.is_empty() {
            return Ok(());
        }
        cpu.install(|| {
            let max = src.par_iter().copied().reduce(|| f32::NEG_INFINITY, f32::max);
            dst.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(d, s)| *d = (*s - max).exp());
            let sum: f32 = dst.par_iter().sum();
            dst.par_iter_mut().for_each(|d| *d /= sum);
        });
        Ok(())
    }

    fn setup_gpu(
        &mut self,
        gpu: &GpuRuntime,
        inputs: &[&Blob],
        output: &Blob,
    ) -> Result<(), LayerError> {
        let input = single_input(inputs)?;
        let block = gpu.channel_block_size();
        let params = SoftmaxParams {
            channels: dim(self.shape.channels, "channels")?,
            channels_padded: dim(self.shape.padded_channels(block), "padded channels")?,
            pixels: dim(self.shape.num * self.shape.height * self.shape.width, "pixels")?,
            _pad: 0,
        };
        // The normalizer needs the whole tensor, so one invocation does the work.
        let info = KernelInfo::new("softmax", "softmax", gpu.base_options(), [1, 1, 1]);
        let args = vec![
            KernelArg::storage(input.device_buffer()?),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform("softmax_params", &params),
        ];
        self.kernels = vec![prepare_kernel(gpu, info, args)?];
        Ok(())
    }

    fn forward_gpu(
        &mut self,
        gpu: &GpuRuntime,
        layer: &str,
        _inputs: &[&Blob],
        _output: &mut Blob,
    ) -> Result<(), LayerError> {
        run_all(gpu, layer, &mut self.kernels)
    }

    fn kernels(&self) -> &[KernelInfo] {
        &self.kernels
    }
}
