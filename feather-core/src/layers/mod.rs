//! Layer operators and the contract every graph node implements.
//!
//! An operator is polymorphic over what it computes (shape inference plus
//! compute) and where it runs (CPU or GPU). Both backends are always compiled;
//! the net picks one at construction and calls the matching pair of entry
//! points.

mod batch_norm;
mod convolution;
mod eltwise;
mod inner_product;
mod input;
mod pooling;
mod relu;
mod scale;
mod softmax;

pub use batch_norm::BatchNormLayer;
pub use convolution::{ConvGeometry, ConvolutionLayer};
pub use eltwise::EltwiseLayer;
pub use inner_product::InnerProductLayer;
pub use input::InputLayer;
pub use pooling::{PoolWindow, PoolingLayer};
pub use relu::ReluLayer;
pub use scale::ScaleLayer;
pub use softmax::SoftmaxLayer;

use std::{any::Any, fmt};

use bytemuck::{Pod, Zeroable};

use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{DeviceBuffer, GpuRuntime, KernelArg, KernelInfo};
use crate::param::{OpParam, WeightBlob};
use crate::runtime::CpuContext;

/// One typed graph node.
pub trait Layer: Send + fmt::Debug {
    fn type_name(&self) -> &'static str;

    /// Number of input blobs the operator reads.
    fn arity(&self) -> usize {
        1
    }

    /// Accept the raw weight tensors of this layer.
    ///
    /// Only checks what the layer parameters alone determine; checks that need
    /// the input shape run in [`Layer::infer_shape`].
    fn bind_weights(&mut self, weights: Vec<WeightBlob>) -> Result<(), String> {
        if weights.is_empty() {
            Ok(())
        } else {
            Err(format!("{} takes no weights, got {}", self.type_name(), weights.len()))
        }
    }

    /// Output shape for the given input shapes.
    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError>;

    /// Whether this operator may absorb the node that follows it.
    fn fusible(&self) -> bool {
        false
    }

    /// Fold `next` into this operator. Returns `true` when it was absorbed.
    fn fuse(&mut self, _next: &dyn Layer) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Compute `output` from `inputs` on the host (NCHW).
    fn forward_cpu(
        &self,
        cpu: &CpuContext,
        inputs: &[&Blob],
        output: &mut Blob,
    ) -> Result<(), LayerError>;

    /// Build kernels and bind arguments once device storage exists.
    fn setup_gpu(
        &mut self,
        _gpu: &GpuRuntime,
        _inputs: &[&Blob],
        _output: &Blob,
    ) -> Result<(), LayerError> {
        Ok(())
    }

    /// Enqueue this layer's kernels.
    fn forward_gpu(
        &mut self,
        gpu: &GpuRuntime,
        layer: &str,
        inputs: &[&Blob],
        output: &mut Blob,
    ) -> Result<(), LayerError>;

    /// Kernel metadata of the last GPU setup.
    fn kernels(&self) -> &[KernelInfo] {
        &[]
    }
}

/// Create the operator a layer record describes.
pub fn create_layer(op: &OpParam) -> Box<dyn Layer> {
    match op {
        OpParam::Input {
            num,
            channels,
            height,
            width,
        } => Box::new(InputLayer::new(BlobShape::new(*num, *channels, *height, *width))),
        OpParam::Relu { negative_slope } => Box::new(ReluLayer::new(*negative_slope)),
        OpParam::Softmax {} => Box::new(SoftmaxLayer::new()),
        OpParam::InnerProduct {
            num_output,
            bias_term,
        } => Box::new(InnerProductLayer::new(*num_output, *bias_term)),
        &OpParam::Convolution {
            num_output,
            kernel_h,
            kernel_w,
            stride_h,
            stride_w,
            pad_h,
            pad_w,
            dilation_h,
            dilation_w,
            group,
            bias_term,
        } => Box::new(ConvolutionLayer::new(
            ConvGeometry {
                num_output,
                kernel_h,
                kernel_w,
                stride_h,
                stride_w,
                pad_h,
                pad_w,
                dilation_h,
                dilation_w,
                group: group.max(1),
            },
            bias_term,
        )),
        &OpParam::Pooling {
            method,
            kernel_h,
            kernel_w,
            stride_h,
            stride_w,
            pad_h,
            pad_w,
            global,
        } => Box::new(PoolingLayer::new(
            method,
            PoolWindow {
                kernel_h,
                kernel_w,
                stride_h,
                stride_w,
                pad_h,
                pad_w,
            },
            global,
        )),
        OpParam::Scale { bias_term } => Box::new(ScaleLayer::new(*bias_term)),
        OpParam::BatchNorm { eps } => Box::new(BatchNormLayer::new(*eps)),
        OpParam::Eltwise { operation, coeffs } => {
            Box::new(EltwiseLayer::new(*operation, coeffs.clone()))
        }
    }
}

/// `true` when `next` is a ReLU that clamps at zero.
pub(crate) fn is_plain_relu(next: &dyn Layer) -> bool {
    next.as_any()
        .downcast_ref::<ReluLayer>()
        .is_some_and(|relu| relu.negative_slope() == 0.0)
}

pub(crate) fn single_input<'a>(inputs: &[&'a Blob]) -> Result<&'a Blob, LayerError> {
    match inputs {
        [input] => Ok(input),
        _ => Err(LayerError::Shape(format!(
            "expected one input, got {}",
            inputs.len()
        ))),
    }
}

pub(crate) fn single_shape(inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
    match inputs {
        [shape] => Ok(*shape),
        _ => Err(LayerError::Shape(format!(
            "expected one input, got {}",
            inputs.len()
        ))),
    }
}

pub(crate) fn dim(value: usize, what: &str) -> Result<u32, LayerError> {
    u32::try_from(value)
        .map_err(|_| LayerError::Unsupported(format!("{what} {value} exceeds the device range")))
}

/// Launch extent of a kernel that owns `block` channels of one pixel per invocation.
pub(crate) fn pixel_gws(shape: BlobShape, block: usize) -> Result<[u32; 3], LayerError> {
    Ok([
        dim(shape.padded_channels(block) / block, "channel blocks")?,
        dim(shape.width, "width")?,
        dim(shape.num * shape.height, "rows")?,
    ])
}

/// Copy `values` into a zero-filled vector of `len` elements.
pub(crate) fn padded(values: &[f32], len: usize) -> Vec<f32> {
    let mut out = vec![0.0; len.max(1)];
    let count = values.len().min(out.len());
    out[..count].copy_from_slice(&values[..count]);
    out
}

/// Uniform layout shared by the per-pixel kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct PixelParams {
    pub channels_padded: u32,
    pub width: u32,
    pub rows: u32,
    pub extra: u32,
}

impl PixelParams {
    pub(crate) fn new(shape: BlobShape, block: usize) -> Result<Self, LayerError> {
        Ok(Self {
            channels_padded: dim(shape.padded_channels(block), "padded channels")?,
            width: dim(shape.width, "width")?,
            rows: dim(shape.num * shape.height, "rows")?,
            extra: 0,
        })
    }
}

/// Build one kernel and bind its arguments in order.
pub(crate) fn prepare_kernel(
    gpu: &GpuRuntime,
    mut info: KernelInfo,
    args: Vec<KernelArg>,
) -> Result<KernelInfo, LayerError> {
    gpu.build_kernel(&mut info)?;
    for (index, arg) in args.into_iter().enumerate() {
        info.set_arg(index, arg)?;
    }
    gpu.bind_args(&mut info)?;
    Ok(info)
}

/// Upload `values` zero-padded to `len` elements.
pub(crate) fn upload_padded(
    gpu: &GpuRuntime,
    values: &[f32],
    len: usize,
    label: &str,
) -> Result<DeviceBuffer, LayerError> {
    Ok(gpu.upload(&padded(values, len), label)?)
}

/// Run every kernel of a layer in order.
pub(crate) fn run_all(
    gpu: &GpuRuntime,
    layer: &str,
    kernels: &mut [KernelInfo],
) -> Result<(), LayerError> {
    if kernels.is_empty() {
        return Err(LayerError::Gpu(crate::error::GpuError::KernelNotBuilt(
            layer.to_string(),
        )));
    }
    for info in kernels {
        gpu.run_kernel(layer, info)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_vectors_keep_values_and_zero_the_tail() {
        assert_eq!(padded(&[1.0, 2.0, 3.0], 4), vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(padded(&[], 0), vec![0.0]);
    }

    #[test]
    fn pixel_gws_counts_channel_blocks() {
        let shape = BlobShape::new(2, 6, 3, 5);
        assert_eq!(pixel_gws(shape, 4).expect("gws"), [2, 5, 6]);
    }

    #[test]
    fn only_zero_slope_relu_is_plain() {
        assert!(is_plain_relu(&ReluLayer::new(0.0)));
        assert!(!is_plain_relu(&ReluLayer::new(0.1)));
        assert!(!is_plain_relu(&SoftmaxLayer::new()));
    }

    #[test]
    fn factory_maps_every_record() {
        let ops = [
            OpParam::Input {
                num: 1,
                channels: 3,
                height: 2,
                width: 2,
            },
            OpParam::Relu {
                negative_slope: 0.0,
            },
            OpParam::Softmax {},
            OpParam::InnerProduct {
                num_output: 4,
                bias_term: true,
            },
            OpParam::Scale { bias_term: false },
            OpParam::BatchNorm { eps: 1e-5 },
        ];
        for op in &ops {
            assert_eq!(create_layer(op).type_name(), op.type_name());
        }
    }
}
