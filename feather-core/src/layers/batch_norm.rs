use std::any::Any;

use super::scale::ChannelAffine;
use super::{Layer, ScaleLayer, is_plain_relu};
use crate::blob::{Blob, BlobShape};
use crate::error::LayerError;
use crate::gpu::{GpuRuntime, KernelInfo};
use crate::param::WeightBlob;
use crate::runtime::CpuContext;

/// Inference-time batch normalization.
///
/// Mean and variance are folded into a per-channel scale and bias when the
/// weights are bound, so execution is a single affine pass. A following Scale
/// folds into the same factors.
#[derive(Debug)]
pub struct BatchNormLayer {
    eps: f32,
    affine: ChannelAffine,
    fused_scale: bool,
}

impl BatchNormLayer {
    pub fn new(eps: f32) -> Self {
        Self {
            eps,
            affine: ChannelAffine::default(),
            fused_scale: false,
        }
    }

    pub fn fused_scale(&self) -> bool {
        self.fused_scale
    }

    pub fn fused_relu(&self) -> bool {
        self.affine.fused_relu
    }
}

impl Layer for BatchNormLayer {
    fn type_name(&self) -> &'static str {
        "BatchNorm"
    }

    fn bind_weights(&mut self, weights: Vec<WeightBlob>) -> Result<(), String> {
        if !(2..=3).contains(&weights.len()) {
            return Err(format!(
                "expected mean, variance and an optional scale factor, got {} blobs",
                weights.len()
            ));
        }
        let (mean, variance) = (&weights[0], &weights[1]);
        if mean.len() != variance.len() {
            return Err(format!(
                "{} means but {} variances",
                mean.len(),
                variance.len()
            ));
        }
        // Stored statistics are sums scaled by a moving-average factor.
        let factor = match weights.get(2).and_then(|f| f.data.first()) {
            Some(&f) if f != 0.0 => 1.0 / f,
            Some(_) => 0.0,
            None => 1.0,
        };
        let (scale, bias): (Vec<f32>, Vec<f32>) = mean
            .data
            .iter()
            .zip(&variance.data)
            .map(|(m, v)| {
                let s = 1.0 / (v * factor + self.eps).sqrt();
                (s, -m * factor * s)
            })
            .unzip();
        self.affine.scale = scale;
        self.affine.bias = bias;
        Ok(())
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        self.affine.infer_shape(inputs)
    }

    fn fusible(&self) -> bool {
        !self.affine.fused_relu
    }

    fn fuse(&mut self, next: &dyn Layer) -> bool {
        if is_plain_relu(next) {
            self.affine.fused_relu = true;
            return true;
        }
        let Some(scale) = next.as_any().downcast_ref::<ScaleLayer>() else {
            return false;
        };
        if self.fused_scale || scale.scale().len() != self.affine.scale.len() {
            return false;
        }
        for (c, (s, b)) in self
            .affine
            .scale
            .iter_mut()
            .zip(self.affine.bias.iter_mut())
            .enumerate()
        {
            let k = scale.scale()[c];
            *s *= k;
            *b = *b * k + scale.bias().get(c).copied().unwrap_or(0.0);
        }
        self.affine.fused_relu = scale.fused_relu();
        self.fused_scale = true;
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
        self.affine.setup_gpu(gpu, inputs, output, "batch_norm")
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

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(eps: f32) -> BatchNormLayer {
        let mut layer = BatchNormLayer::new(eps);
        layer
            .bind_weights(vec![
                WeightBlob::vector(vec![2.0, 4.0]),
                WeightBlob::vector(vec![8.0, 32.0]),
                WeightBlob::vector(vec![2.0]),
            ])
            .expect("bind");
        layer
    }

    #[test]
    fn statistics_fold_into_scale_and_bias() {
        let layer = bound(0.0);
        // mean = [1, 2], var = [4, 16] after the factor.
        assert_eq!(layer.affine.scale, vec![0.5, 0.25]);
        assert_eq!(layer.affine.bias, vec![-0.5, -0.5]);
    }

    #[test]
    fn following_scale_folds_in() {
        let mut layer = bound(0.0);
        let mut scale = ScaleLayer::new(true);
        scale
            .bind_weights(vec![
                WeightBlob::vector(vec![2.0, 4.0]),
                WeightBlob::vector(vec![1.0, 1.0]),
            ])
            .expect("bind");
        assert!(layer.fuse(&scale));
        assert!(layer.fused_scale());
        assert_eq!(layer.affine.scale, vec![1.0, 1.0]);
        assert_eq!(layer.affine.bias, vec![0.0, -1.0]);
        assert!(!layer.fused_relu());

        let mismatched = ScaleLayer::new(false);
        assert!(!bound(0.0).fuse(&mismatched));
    }
}
