use std::any::Any;

use rayon::prelude::*;

use super::{
    Layer, PixelParams, is_plain_relu, pixel_gws, prepare_kernel, run_all, single_input,
    single_shape, upload_padded,
};
use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{DeviceBuffer, GpuRuntime, KernelArg, KernelInfo};
use crate::param::WeightBlob;
use crate::runtime::CpuContext;

/// Per-channel `x * scale + bias`, shared by Scale and folded BatchNorm.
#[derive(Debug, Default)]
pub(crate) struct ChannelAffine {
    pub scale: Vec<f32>,
    pub bias: Vec<f32>,
    pub fused_relu: bool,
    shape: BlobShape,
    device_weights: Vec<DeviceBuffer>,
    kernels: Vec<KernelInfo>,
}

impl ChannelAffine {
    pub(crate) fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        let input = single_shape(inputs)?;
        if self.scale.len() != input.channels {
            return Err(LayerError::Weights(format!(
                "{} per-channel factors for input {input}",
                self.scale.len()
            )));
        }
        self.shape = input;
        Ok(input)
    }

    pub(crate) fn forward_cpu(
        &self,
        cpu: &CpuContext,
        inputs: &[&Blob],
        output: &mut Blob,
    ) -> Result<(), LayerError> {
        let src = single_input(inputs)?.data()?;
        let dst = output.data_mut()?;
        let plane = self.shape.height * self.shape.width;
        let channels = self.shape.channels;
        let (scale, bias, relu) = (&self.scale, &self.bias, self.fused_relu);
        cpu.install(|| {
            dst.par_chunks_mut(plane.max(1))
                .zip(src.par_chunks(plane.max(1)))
                .enumerate()
                .for_each(|(index, (out, input))| {
                    let c = index % channels;
                    let (s, b) = (scale[c], bias.get(c).copied().unwrap_or(0.0));
                    for (d, x) in out.iter_mut().zip(input) {
                        let v = x * s + b;
                        *d = if relu { v.max(0.0) } else { v };
                    }
                });
        });
        Ok(())
    }

    pub(crate) fn setup_gpu(
        &mut self,
        gpu: &GpuRuntime,
        inputs: &[&Blob],
        output: &Blob,
        label: &str,
    ) -> Result<(), LayerError> {
        let input = single_input(inputs)?;
        let block = gpu.channel_block_size();
        let cp = self.shape.padded_channels(block);
        let scale = upload_padded(gpu, &self.scale, cp, &format!("{label}_scale"))?;
        let bias = upload_padded(gpu, &self.bias, cp, &format!("{label}_bias"))?;
        let params = PixelParams::new(self.shape, block)?;
        let options = gpu.base_options().define_if("USE_RELU", self.fused_relu);
        let info = KernelInfo::new("scale", "scale", options, pixel_gws(self.shape, block)?);
        let args = vec![
            KernelArg::storage(input.device_buffer()?),
            KernelArg::storage(&scale),
            KernelArg::storage(&bias),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform(&format!("{label}_params"), &params),
        ];
        self.kernels = vec![prepare_kernel(gpu, info, args)?];
        self.device_weights = vec![scale, bias];
        Ok(())
    }

    pub(crate) fn forward_gpu(&mut self, gpu: &GpuRuntime, layer: &str) -> Result<(), LayerError> {
        run_all(gpu, layer, &mut self.kernels)
    }

    pub(crate) fn kernels(&self) -> &[KernelInfo] {
        &self.kernels
    }
}

/// Learned per-channel scale with optional bias.
#[derive(Debug)]
pub struct ScaleLayer {
    bias_term: bool,
    affine: ChannelAffine,
}

impl ScaleLayer {
    pub fn new(bias_term: bool) -> Self {
        Self {
            bias_term,
            affine: ChannelAffine::default(),
        }
    }

    pub fn scale(&self) -> &[f32] {
        &self.affine.scale
    }

    pub fn bias(&self) -> &[f32] {
        &self.affine.bias
    }

    pub fn fused_relu(&self) -> bool {
        self.affine.fused_relu
    }
}

impl Layer for ScaleLayer {
    fn type_name(&self) -> &'static str {
        "Scale"
    }

    fn bind_weights(&mut self, weights: Vec<WeightBlob>) -> Result<(), String> {
        let expected = 1 + usize::from(self.bias_term);
        if weights.len() != expected {
            return Err(format!("expected {expected} weight blobs, got {}", weights.len()));
        }
        let mut weights = weights.into_iter();
        let scale = weights.next().ok_or("missing scale")?;
        if let Some(bias) = weights.next() {
            if bias.len() != scale.len() {
                return Err(format!(
                    "{} scale values but {} bias values",
                    scale.len(),
                    bias.len()
                ));
            }
            self.affine.bias = bias.data;
        }
        self.affine.scale = scale.data;
        Ok(())
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        self.affine.infer_shape(inputs)
    }

    fn fusible(&self) -> bool {
        !self.affine.fused_relu
    }

    fn fuse(&mut self, next: &dyn Layer) -> bool {
        if !is_plain_relu(next) {
            return false;
        }
        self.affine.fused_relu = true;
        true
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
        self.affine.forward_cpu(cpu, inputs, output)
    }

    fn setup_gpu(
        &mut self,
        gpu: &GpuRuntime,
        inputs: &[&Blob],
        output: &Blob,
    ) -> Result<(), LayerError> {
        self.affine.setup_gpu(gpu, inputs, output, "scale")
    }

    fn forward_gpu(
        &mut self,
        gpu: &GpuRuntime,
        layer: &str,
        _inputs: &[&Blob],
        _output: &mut Blob,
    ) -> Result<(), LayerError> {
        self.affine.forward_gpu(gpu, layer)
    }

    fn kernels(&self) -> &[KernelInfo] {
        self.affine.kernels()
    }
}
