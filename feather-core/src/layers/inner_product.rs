use std::any::Any;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use super::{
    Layer, dim, is_plain_relu, prepare_kernel, run_all, single_input, single_shape, upload_padded,
};
use crate::blob::{Blob, BlobShape, channels_padding};
use crate::error::LayerError;
use crate::gpu::{DeviceBuffer, GpuRuntime, KernelArg, KernelInfo};
use crate::param::WeightBlob;
use crate::runtime::CpuContext;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct InnerProductParams {
    k_len: u32,
    out_padded: u32,
    num: u32,
    _pad: u32,
}

/// Fully connected layer over the flattened per-image input.
#[derive(Debug)]
pub struct InnerProductLayer {
    num_output: usize,
    bias_term: bool,
    weights: Vec<f32>,
    bias: Vec<f32>,
    fused_relu: bool,
    input_shape: BlobShape,
    device_weights: Vec<DeviceBuffer>,
    kernels: Vec<KernelInfo>,
}

impl InnerProductLayer {
    pub fn new(num_output: usize, bias_term: bool) -> Self {
        Self {
            num_output,
            bias_term,
            weights: Vec::new(),
            bias: Vec::new(),
            fused_relu: false,
            input_shape: BlobShape::default(),
            device_weights: Vec::new(),
            kernels: Vec::new(),
        }
    }

    pub fn fused_relu(&self) -> bool {
        self.fused_relu
    }

    /// Host weights `[out][c][h][w]` rearranged to `[out_padded][h][w][c_padded]`.
    fn device_weight_layout(&self, block: usize) -> Vec<f32> {
        let BlobShape {
            channels: c,
            height: h,
            width: w,
            ..
        } = self.input_shape;
        let cp = channels_padding(c, block);
        let op = channels_padding(self.num_output, block);
        let k = c * h * w;
        let mut out = vec![0.0; op * h * w * cp];
        for o in 0..self.num_output {
            for ch in 0..c {
                for y in 0..h {
                    for x in 0..w {
                        out[((o * h + y) * w + x) * cp + ch] =
                            self.weights[o * k + (ch * h + y) * w + x];
                    }
                }
            }
        }
        out
    }
}

impl Layer for InnerProductLayer {
    fn type_name(&self) -> &'static str {
        "InnerProduct"
    }

    fn bind_weights(&mut self, weights: Vec<WeightBlob>) -> Result<(), String> {
        let expected = 1 + usize::from(self.bias_term);
        if weights.len() != expected {
            return Err(format!("expected {expected} weight blobs, got {}", weights.len()));
        }
        let mut weights = weights.into_iter();
        let filter = weights.next().ok_or("missing filter")?;
        if filter.leading_dim() != self.num_output {
            return Err(format!(
                "num_output is {} but the weight leading dimension is {}",
                self.num_output,
                filter.leading_dim()
            ));
        }
        if self.num_output == 0 || filter.len() % self.num_output != 0 {
            return Err(format!(
                "{} weight values do not split into {} outputs",
                filter.len(),
                self.num_output
            ));
        }
        if let Some(bias) = weights.next() {
            if bias.len() != self.num_output {
                return Err(format!(
                    "bias has {} values for {} outputs",
                    bias.len(),
                    self.num_output
                ));
            }
            self.bias = bias.data;
        }
        self.weights = filter.data;
        Ok(())
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        let input = single_shape(inputs)?;
        if self.weights.is_empty() {
            return Err(LayerError::Weights("no weights bound".into()));
        }
        let k = input.per_image();
        if k * self.num_output != self.weights.len() {
            return Err(LayerError::Weights(format!(
                "input {input} has {k} values per image but the weights expect {}",
                self.weights.len() / self.num_output
            )));
        }
        self.input_shape = input;
        Ok(BlobShape::new(input.num, self.num_output, 1, 1))
    }

    fn fusible(&self) -> bool {
        !self.fused_relu
    }

    fn fuse(&mut self, next: &dyn Layer) -> bool {
        if !is_plain_relu(next) {
            return false;
        }
        self.fused_relu = true;
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
        let src = single_input(inputs)?.data()?;
        let dst = output.data_mut()?;
        let k = self.input_shape.per_image();
        let outputs = self.num_output;
        let (weights, bias, relu) = (&self.weights, &self.bias, self.fused_relu);
        cpu.install(|| {
            dst.par_chunks_mut(outputs)
                .zip(src.par_chunks(k))
                .for_each(|(out, image)| {
                    for (o, value) in out.iter_mut().enumerate() {
                        let row = &weights[o * k..(o + 1) * k];
                        let mut acc: f32 = row.iter().zip(image).map(|(w, x)| w * x).sum();
                        if let Some(b) = bias.get(o) {
                            acc += b;
                        }
                        if relu {
                            acc = acc.max(0.0);
                        }
                        *value = acc;
                    }
                });
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
        let out_padded = channels_padding(self.num_output, block);
        let layout = self.device_weight_layout(block);
        let k_len = layout.len() / out_padded.max(1);

        let weights = gpu.upload(&layout, "inner_product_weights")?;
        let bias = upload_padded(gpu, &self.bias, out_padded, "inner_product_bias")?;
        let params = InnerProductParams {
            k_len: dim(k_len, "reduction length")?,
            out_padded: dim(out_padded, "padded outputs")?,
            num: dim(self.input_shape.num, "batch")?,
            _pad: 0,
        };
        let options = gpu
            .base_options()
            .define_if("BIAS", self.bias_term)
            .define_if("USE_RELU", self.fused_relu);
        let gws = [
            dim(out_padded / block, "output blocks")?,
            1,
            params.num,
        ];
        let info = KernelInfo::new("inner_product", "inner_product", options, gws);
        let args = vec![
            KernelArg::storage(input.device_buffer()?),
            KernelArg::storage(&weights),
            KernelArg::storage(&bias),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform("inner_product_params", &params),
        ];
        self.kernels = vec![prepare_kernel(gpu, info, args)?];
        self.device_weights = vec![weights, bias];
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
