use std::any::Any;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use super::{Layer, PixelParams, is_plain_relu, pixel_gws, prepare_kernel, run_all};
use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{GpuRuntime, KernelArg, KernelInfo};
use crate::param::EltwiseOp;
use crate::runtime::CpuContext;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct EltwiseParams {
    pixel: PixelParams,
    coeff0: f32,
    coeff1: f32,
    _pad: [u32; 2],
}

/// Element-wise product, weighted sum or maximum of two blobs.
#[derive(Debug)]
pub struct EltwiseLayer {
    operation: EltwiseOp,
    coeffs: Vec<f32>,
    fused_relu: bool,
    shape: BlobShape,
    kernels: Vec<KernelInfo>,
}

impl EltwiseLayer {
    pub fn new(operation: EltwiseOp, coeffs: Vec<f32>) -> Self {
        Self {
            operation,
            coeffs,
            fused_relu: false,
            shape: BlobShape::default(),
            kernels: Vec::new(),
        }
    }

    pub fn operation(&self) -> EltwiseOp {
        self.operation
    }

    pub fn fused_relu(&self) -> bool {
        self.fused_relu
    }

    fn sum_coeffs(&self) -> [f32; 2] {
        match self.coeffs.as_slice() {
            [a, b] => [*a, *b],
            _ => [1.0, 1.0],
        }
    }

    fn two_inputs<'a>(inputs: &[&'a Blob]) -> Result<(&'a Blob, &'a Blob), LayerError> {
        match inputs {
            [a, b] => Ok((a, b)),
            _ => Err(LayerError::Shape(format!(
                "eltwise expects two inputs, got {}",
                inputs.len()
            ))),
        }
    }
}

impl Layer for EltwiseLayer {
    fn type_name(&self) -> &'static str {
        "Eltwise"
    }

    fn arity(&self) -> usize {
        2
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        let [a, b] = inputs else {
            return Err(LayerError::Shape(format!(
                "eltwise expects two inputs, got {}",
                inputs.len()
            )));
        };
        if a != b {
            return Err(LayerError::Shape(format!("input shapes differ: {a} vs {b}")));
        }
        if !self.coeffs.is_empty()
            && (self.operation != EltwiseOp::Sum || self.coeffs.len() != inputs.len())
        {
            return Err(LayerError::Unsupported(format!(
                "{} coefficients for a {:?} of {} inputs",
                self.coeffs.len(),
                self.operation,
                inputs.len()
            )));
        }
        self.shape = *a;
        Ok(*a)
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
        let (a, b) = Self::two_inputs(inputs)?;
        let (lhs, rhs) = (a.data()?, b.data()?);
        let dst = output.data_mut()?;
        let [c0, c1] = self.sum_coeffs();
        let (operation, relu) = (self.operation, self.fused_relu);
        cpu.install(|| {
            dst.par_iter_mut()
                .zip(lhs.par_iter().zip(rhs.par_iter()))
                .for_each(|(d, (x, y))| {
                    let v = match operation {
                        EltwiseOp::Prod => x * y,
                        EltwiseOp::Sum => x * c0 + y * c1,
                        EltwiseOp::Max => x.max(*y),
                    };
                    *d = if relu { v.max(0.0) } else { v };
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
        let (a, b) = Self::two_inputs(inputs)?;
        let block = gpu.channel_block_size();
        let [coeff0, coeff1] = self.sum_coeffs();
        let params = EltwiseParams {
            pixel: PixelParams::new(self.shape, block)?,
            coeff0,
            coeff1,
            _pad: [0; 2],
        };
        let operation = match self.operation {
            EltwiseOp::Prod => 0,
            EltwiseOp::Sum => 1,
            EltwiseOp::Max => 2,
        };
        let options = gpu
            .base_options()
            .define_value("OPERATION", operation)
            .define_if("USE_RELU", self.fused_relu);
        let info = KernelInfo::new("eltwise", "eltwise", options, pixel_gws(self.shape, block)?);
        let args = vec![
            KernelArg::storage(a.device_buffer()?),
            KernelArg::storage(b.device_buffer()?),
            KernelArg::storage(output.device_buffer()?),
            gpu.uniform("eltwise_params", &params),
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
    fn inputs_must_agree_in_shape() {
        let mut layer = EltwiseLayer::new(EltwiseOp::Sum, vec![]);
        let shape = BlobShape::new(1, 2, 3, 3);
        assert_eq!(layer.infer_shape(&[shape, shape]).expect("shape"), shape);
        assert!(layer.infer_shape(&[shape, BlobShape::new(1, 2, 3, 4)]).is_err());
        assert!(layer.infer_shape(&[shape]).is_err());
    }

    #[test]
    fn coefficients_only_apply_to_sums() {
        let shape = BlobShape::new(1, 1, 1, 1);
        let mut weighted = EltwiseLayer::new(EltwiseOp::Sum, vec![0.5, -1.0]);
        assert!(weighted.infer_shape(&[shape, shape]).is_ok());
        assert_eq!(weighted.sum_coeffs(), [0.5, -1.0]);

        let mut product = EltwiseLayer::new(EltwiseOp::Prod, vec![0.5, -1.0]);
        assert!(matches!(
            product.infer_shape(&[shape, shape]),
            Err(LayerError::Unsupported(_))
        ));
    }
}
