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
struct ConvParams {
    in_c: u32,
    in_cp: u32,
    in_h: u32,
    in_w: u32,
    out_c: u32,
    out_cp: u32,
    out_h: u32,
    out_w: u32,
    kernel_h: u32,
    kernel_w: u32,
    stride_h: u32,
    stride_w: u32,
    pad_h: u32,
    pad_w: u32,
    dilation_h: u32,
    dilation_w: u32,
    group: u32,
    num: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Window geometry of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub num_output: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub group: usize,
}

impl ConvGeometry {
    /// Output extent along one axis, or `None` when the window does not fit.
    fn output_extent(input: usize, kernel: usize, stride: usize, pad: usize, dilation: usize) -> Option<usize> {
        let span = dilation * (kernel.max(1) - 1) + 1;
        let padded = input + 2 * pad;
        (padded >= span && stride > 0).then(|| (padded - span) / stride + 1)
    }
}

/// Grouped 2D convolution with optional bias.
#[derive(Debug)]
pub struct ConvolutionLayer {
    geometry: ConvGeometry,
    bias_term: bool,
    weights: Vec<f32>,
    bias: Vec<f32>,
    fused_relu: bool,
    input_shape: BlobShape,
    output_shape: BlobShape,
    device_weights: Vec<DeviceBuffer>,
    kernels: Vec<KernelInfo>,
}

impl ConvolutionLayer {
    pub fn new(geometry: ConvGeometry, bias_term: bool) -> Self {
        Self {
            geometry,
            bias_term,
            weights: Vec::new(),
            bias: Vec::new(),
            fused_relu: false,
            input_shape: BlobShape::default(),
            output_shape: BlobShape::default(),
            device_weights: Vec::new(),
            kernels: Vec::new(),
        }
    }

    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    pub fn fused_relu(&self) -> bool {
        self.fused_relu
    }

    fn in_per_group(&self) -> usize {
        self.input_shape.channels / self.geometry.group
    }

    /// Host filters `[out][in_per_group][kh][kw]` as `[out_padded][kh][kw][in_per_group]`.
    fn device_weight_layout(&self, block: usize) -> Vec<f32> {
        let g = &self.geometry;
        let ipg = self.in_per_group();
        let (kh, kw) = (g.kernel_h, g.kernel_w);
        let op = channels_padding(g.num_output, block);
        let mut out = vec![0.0; op * kh * kw * ipg];
        for o in 0..g.num_output {
            for ci in 0..ipg {
                for i in 0..kh {
                    for j in 0..kw {
                        out[((o * kh + i) * kw + j) * ipg + ci] =
                            self.weights[((o * ipg + ci) * kh + i) * kw + j];
                    }
                }
            }
        }
        out
    }
}

impl Layer for ConvolutionLayer {
    fn type_name(&self) -> &'static str {
        "Convolution"
    }

    fn bind_weights(&mut self, weights: Vec<WeightBlob>) -> Result<(), String> {
        let g = self.geometry;
        let expected = 1 + usize::from(self.bias_term);
        if weights.len() != expected {
            return Err(format!("expected {expected} weight blobs, got {}", weights.len()));
        }
        if g.num_output == 0 || g.num_output % g.group != 0 {
            return Err(format!(
                "num_output {} is not divisible into {} groups",
                g.num_output, g.group
            ));
        }
        let mut weights = weights.into_iter();
        let filter = weights.next().ok_or("missing filter")?;
        if filter.leading_dim() != g.num_output {
            return Err(format!(
                "num_output is {} but the filter leading dimension is {}",
                g.num_output,
                filter.leading_dim()
            ));
        }
        if filter.dims.len() == 4 && (filter.dims[2] != g.kernel_h || filter.dims[3] != g.kernel_w) {
            return Err(format!(
                "filter dims {:?} do not match kernel {}x{}",
                filter.dims, g.kernel_h, g.kernel_w
            ));
        }
        let per_output = g.kernel_h * g.kernel_w;
        if per_output == 0 || filter.len() % (g.num_output * per_output) != 0 {
            return Err(format!(
                "{} filter values do not fit {} outputs of a {}x{} kernel",
                filter.len(),
                g.num_output,
                g.kernel_h,
                g.kernel_w
            ));
        }
        if let Some(bias) = weights.next() {
            if bias.len() != g.num_output {
                return Err(format!(
                    "bias has {} values for {} outputs",
                    bias.len(),
                    g.num_output
                ));
            }
            self.bias = bias.data;
        }
        self.weights = filter.data;
        Ok(())
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        let input = single_shape(inputs)?;
        let g = self.geometry;
        if self.weights.is_empty() {
            return Err(LayerError::Weights("no weights bound".into()));
        }
        if input.channels % g.group != 0 {
            return Err(LayerError::Shape(format!(
                "{} input channels are not divisible into {} groups",
                input.channels, g.group
            )));
        }
        let ipg = input.channels / g.group;
        if self.weights.len() != g.num_output * ipg * g.kernel_h * g.kernel_w {
            return Err(LayerError::Weights(format!(
                "filters hold {} values but input {input} needs {}",
                self.weights.len(),
                g.num_output * ipg * g.kernel_h * g.kernel_w
            )));
        }
        let out_h = ConvGeometry::output_extent(input.height, g.kernel_h, g.stride_h, g.pad_h, g.dilation_h);
        let out_w = ConvGeometry::output_extent(input.width, g.kernel_w, g.stride_w, g.pad_w, g.dilation_w);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(LayerError::Shape(format!(
                "kernel {}x{} does not fit input {input}",
                g.kernel_h, g.kernel_w
            )));
        };
        self.input_shape = input;
        self.output_shape = BlobShape::new(input.num, g.num_output, out_h, out_w);
        Ok(self.output_shape)
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
        let g = self.geometry;
        let input = self.input_shape;
        let out = self.output_shape;
        let ipg = self.in_per_group();
        let opg = g.num_output / g.group;
        let plane = out.height * out.width;
        let (weights, bias, relu) = (&self.weights, &self.bias, self.fused_relu);

        cpu.install(|| {
            dst.par_chunks_mut(plane.max(1))
                .enumerate()
                .for_each(|(index, plane_out)| {
                    let n = index / g.num_output;
                    let oc = index % g.num_output;
                    let group = oc / opg;
                    let b = bias.get(oc).copied().unwrap_or(0.0);
                    for oy in 0..out.height {
                        for ox in 0..out.width {
                            let mut acc = b;
                            for ci in 0..ipg {
                                let channel = group * ipg + ci;
                                let src_plane = (n * input.channels + channel) * input.height;
                                for i in 0..g.kernel_h {
                                    let y = (oy * g.stride_h + i * g.dilation_h) as isize - g.pad_h as isize;
                                    if y < 0 || y >= input.height as isize {
                                        continue;
                                    }
                                    for j in 0..g.kernel_w {
                                        let x = (ox * g.stride_w + j * g.dilation_w) as isize
                                            - g.pad_w as isize;
                                        if x < 0 || x >= input.width as isize {
                                            continue;
                                        }
                                        let value = src[(src_plane + y as usize) * input.width + x as usize];
                                        let w = weights[((oc * ipg + ci) * g.kernel_h + i) * g.kernel_w + j];
                                        acc += value * w;
                                    }
                                }
                            }
                            plane_out[oy * out.width + ox] = if relu { acc.max(0.0) } else { acc };
                        }
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
        let g = self.geometry;
        let (ins, outs) = (self.input_shape, self.output_shape);
        let out_cp = outs.padded_channels(block);

        let weights = gpu.upload(&self.device_weight_layout(block), "convolution_weights")?;
        let bias = upload_padded(gpu, &self.bias, out_cp, "convolution_bias")?;
        let params = ConvParams {
            in_c: dim(ins.channels, "input channels")?,
            in_cp: dim(ins.padded_channels(block), "padded input channels")?,
            in_h: dim(ins.height, "input height")?,
            in_w: dim(ins.width, "input width")?,
            out_c: dim(outs.channels, "output channels")?,
            out_cp: dim(out_cp, "padded output channels")?,
            out_h: dim(outs.height, "output height")?,
            out_w: dim(outs.width, "output width")?,
            kernel_h: dim(g.kernel_h, "kernel height")?,
            kernel_w: dim(g.kernel_w, "kernel width")?,
            stride_h: dim(g.stride_h, "stride")?,
            stride_w: dim(g.stride_w, "stride")?,
            pad_h: dim(g.pad_h, "pad")?,
            pad_w: dim(g.pad_w, "pad")?,
            dilation_h: dim(g.dilation_h, "dilation")?,
            dilation_w: dim(g.dilation_w, "dilation")?,
            group: dim(g.group, "group")?,
            num: dim(outs.num, "batch")?,
            _pad0: 0,
            _pad1: 0,
        };
        let options = gpu
            .base_options()
            .define_if("BIAS", self.bias_term)
            .define_if("USE_RELU", self.fused_relu);
        let gws = [
            dim(out_cp / block, "output blocks")?,
            params.out_w,
            dim(outs.num * outs.height, "output rows")?,
        ];
        let info = KernelInfo::new("convolution", "convolution", options, gws);
        let args = vec![
            KernelArg::storage(input.device_buffer()?),
            KernelArg::storage(&weights),
            KernelArg::storage(&bias),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform("convolution_params", &params),
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
