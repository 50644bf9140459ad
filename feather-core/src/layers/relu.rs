use std::any::Any;

use rayon::prelude::*;

use super::{Layer, PixelParams, pixel_gws, prepare_kernel, run_all, single_input, single_shape};
use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{GpuRuntime, KernelArg, KernelInfo};
use crate::runtime::CpuContext;

/// Leaky rectifier, `max(x, 0) + slope * min(x, 0)`.
#[derive(Debug)]
pub struct ReluLayer {
    negative_slope: f32,
    shape: BlobShape,
    kernels: Vec<KernelInfo>,
}

impl ReluLayer {
    pub fn new(negative_slope: f32) -> Self {
        Self {
            negative_slope,
            shape: BlobShape::default(),
            kernels: Vec::new(),
        }
    }

    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }
}

pub(crate) fn leaky_relu(value: f32, slope: f32) -> f32 {
    value.max(0.0) + slope * value.min(0.0)
}

impl Layer for ReluLayer {
    fn type_name(&self) -> &'static str {
        "ReLU"
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
        let slope = self.negative_slope;
        cpu.install(|| {
            dst.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(d, s)| *d = leaky_relu(*s, slope));
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
        let mut params = PixelParams::new(self.shape, block)?;
        // The fourth uniform slot holds the slope as f32.
        params.extra = self.negative_slope.to_bits();
        let info = KernelInfo::new("activation", "relu", gpu.base_options(), pixel_gws(self.shape, block)?);
        let args = vec![
            KernelArg::storage(input.device_buffer()?),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform("relu_params", &params),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaky_relu_scales_negatives_only() {
        assert_eq!(leaky_relu(-2.0, 0.1), -0.2);
        assert_eq!(leaky_relu(0.0, 0.1), 0.0);
        assert_eq!(leaky_relu(3.0, 0.1), 3.0);
        assert_eq!(leaky_relu(-3.0, 0.0), 0.0);
    }
}
