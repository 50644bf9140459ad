use std::any::Any;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use super::{Layer, dim, prepare_kernel, run_all, single_input, single_shape};
use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{GpuRuntime, KernelArg, KernelInfo};
use crate::param::PoolMethod;
use crate::runtime::CpuContext;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PoolParams {
    channels_padded: u32,
    in_h: u32,
    in_w: u32,
    out_h: u32,
    out_w: u32,
    kernel_h: u32,
    kernel_w: u32,
    stride_h: u32,
    stride_w: u32,
    pad_h: u32,
    pad_w: u32,
    num: u32,
}

/// Pooling window. Ignored for global pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolWindow {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
}

impl PoolWindow {
    fn global(height: usize, width: usize) -> Self {
        Self {
            kernel_h: height,
            kernel_w: width,
            stride_h: 1,
            stride_w: 1,
            pad_h: 0,
            pad_w: 0,
        }
    }
}

/// Output extent with ceil rounding; the last window must start inside the
/// input or its leading padding.
fn pooled_extent(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    let padded = input + 2 * pad;
    if kernel == 0 || stride == 0 || padded < kernel {
        return None;
    }
    let mut out = (padded - kernel).div_ceil(stride) + 1;
    if pad > 0 && (out - 1) * stride >= input + pad {
        out -= 1;
    }
    Some(out)
}

/// Max or average pooling.
#[derive(Debug)]
pub struct PoolingLayer {
    method: PoolMethod,
    window: PoolWindow,
    global: bool,
    effective: PoolWindow,
    input_shape: BlobShape,
    output_shape: BlobShape,
    kernels: Vec<KernelInfo>,
}

impl PoolingLayer {
    pub fn new(method: PoolMethod, window: PoolWindow, global: bool) -> Self {
        Self {
            method,
            window,
            global,
            effective: window,
            input_shape: BlobShape::default(),
            output_shape: BlobShape::default(),
            kernels: Vec::new(),
        }
    }

    pub fn method(&self) -> PoolMethod {
        self.method
    }
}

fn pool_plane(
    src: &[f32],
    dst: &mut [f32],
    input: BlobShape,
    output: BlobShape,
    window: PoolWindow,
    method: PoolMethod,
) {
    let (in_h, in_w) = (input.height as isize, input.width as isize);
    for oy in 0..output.height {
        for ox in 0..output.width {
            let h_start = (oy * window.stride_h) as isize - window.pad_h as isize;
            let w_start = (ox * window.stride_w) as isize - window.pad_w as isize;
            let h_end = (h_start + window.kernel_h as isize).min(in_h + window.pad_h as isize);
            let w_end = (w_start + window.kernel_w as isize).min(in_w + window.pad_w as isize);
            let pool_size = ((h_end - h_start) * (w_end - w_start)) as f32;
            let (h0, w0) = (h_start.max(0), w_start.max(0));
            let (h1, w1) = (h_end.min(in_h), w_end.min(in_w));

            let mut acc: Option<f32> = None;
            for y in h0..h1 {
                for x in w0..w1 {
                    let v = src[y as usize * input.width + x as usize];
                    acc = Some(match (method, acc) {
                        (_, None) => v,
                        (PoolMethod::Max, Some(a)) => a.max(v),
                        (PoolMethod::Average, Some(a)) => a + v,
                    });
                }
            }
            let value = acc.unwrap_or(0.0);
            dst[oy * output.width + ox] = match method {
                PoolMethod::Max => value,
                PoolMethod::Average if pool_size > 0.0 => value / pool_size,
                PoolMethod::Average => 0.0,
            };
        }
    }
}

impl Layer for PoolingLayer {
    fn type_name(&self) -> &'static str {
        "Pooling"
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        let input = single_shape(inputs)?;
        let window = if self.global {
            PoolWindow::global(input.height, input.width)
        } else {
            self.window
        };
        if window.pad_h >= window.kernel_h.max(1) || window.pad_w >= window.kernel_w.max(1) {
            return Err(LayerError::Shape(format!(
                "padding {}x{} must be smaller than the {}x{} window",
                window.pad_h, window.pad_w, window.kernel_h, window.kernel_w
            )));
        }
        let out_h = pooled_extent(input.height, window.kernel_h, window.stride_h, window.pad_h);
        let out_w = pooled_extent(input.width, window.kernel_w, window.stride_w, window.pad_w);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(LayerError::Shape(format!(
                "window {}x{} stride {}x{} does not fit input {input}",
                window.kernel_h, window.kernel_w, window.stride_h, window.stride_w
            )));
        };
        self.effective = window;
        self.input_shape = input;
        self.output_shape = BlobShape::new(input.num, input.channels, out_h, out_w);
        Ok(self.output_shape)
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
        let (input, out) = (self.input_shape, self.output_shape);
        let in_plane = input.height * input.width;
        let out_plane = out.height * out.width;
        let (window, method) = (self.effective, self.method);
        cpu.install(|| {
            dst.par_chunks_mut(out_plane.max(1))
                .zip(src.par_chunks(in_plane.max(1)))
                .for_each(|(plane_out, plane_in)| {
                    pool_plane(plane_in, plane_out, input, out, window, method);
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
        let (ins, outs, w) = (self.input_shape, self.output_shape, self.effective);
        let params = PoolParams {
            channels_padded: dim(ins.padded_channels(block), "padded channels")?,
            in_h: dim(ins.height, "input height")?,
            in_w: dim(ins.width, "input width")?,
            out_h: dim(outs.height, "output height")?,
            out_w: dim(outs.width, "output width")?,
            kernel_h: dim(w.kernel_h, "kernel height")?,
            kernel_w: dim(w.kernel_w, "kernel width")?,
            stride_h: dim(w.stride_h, "stride")?,
            stride_w: dim(w.stride_w, "stride")?,
            pad_h: dim(w.pad_h, "pad")?,
            pad_w: dim(w.pad_w, "pad")?,
            num: dim(outs.num, "batch")?,
        };
        let method = match self.method {
            PoolMethod::Max => 0,
            PoolMethod::Average => 1,
        };
        let options = gpu.base_options().define_value("POOL_METHOD", method);
        let gws = [
            dim(outs.padded_channels(block) / block, "channel blocks")?,
            params.out_w,
            dim(outs.num * outs.height, "output rows")?,
        ];
        let info = KernelInfo::new("pooling", "pooling", options, gws);
        let args = vec![
            KernelArg::storage(input.device_buffer()?),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform("pooling_params", &params),
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
    fn extent_rounds_up_and_clips_the_last_window() {
        assert_eq!(pooled_extent(4, 2, 2, 0), Some(2));
        assert_eq!(pooled_extent(5, 2, 2, 0), Some(3));
        assert_eq!(pooled_extent(5, 3, 2, 1), Some(3));
        assert_eq!(pooled_extent(4, 3, 2, 1), Some(3));
        assert_eq!(pooled_extent(3, 2, 2, 1), Some(2));
        assert_eq!(pooled_extent(1, 3, 1, 0), None);
    }

    #[test]
    fn average_divides_by_the_padded_window() {
        let input = BlobShape::new(1, 1, 2, 2);
        let output = BlobShape::new(1, 1, 2, 2);
        let window = PoolWindow {
            kernel_h: 2,
            kernel_w: 2,
            stride_h: 1,
            stride_w: 1,
            pad_h: 1,
            pad_w: 1,
        };
        let mut dst = [0.0; 4];
        pool_plane(&[4.0, 4.0, 4.0, 4.0], &mut dst, input, output, window, PoolMethod::Average);
        assert_eq!(dst, [1.0, 2.0, 2.0, 4.0]);

        pool_plane(&[1.0, 2.0, 3.0, 4.0], &mut dst, input, output, window, PoolMethod::Max);
        assert_eq!(dst, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn global_pooling_covers_the_plane() {
        let mut layer = PoolingLayer::new(
            PoolMethod::Average,
            PoolWindow::global(0, 0),
            true,
        );
        let shape = layer.infer_shape(&[BlobShape::new(2, 3, 5, 7)]).expect("shape");
        assert_eq!(shape, BlobShape::new(2, 3, 1, 1));
    }
}
