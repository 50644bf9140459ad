use std::any::Any;

use super::Layer;
use crate::blob::{Blob, BlobShape, nchw_to_padded_nhwc};
use crate::error::LayerError;
use crate::gpu::GpuRuntime;
use crate::runtime::CpuContext;

/// External input. Its blob is filled by `Net::set_input`.
#[derive(Debug)]
pub struct InputLayer {
    shape: BlobShape,
}

impl InputLayer {
    pub fn new(shape: BlobShape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> BlobShape {
        self.shape
    }

    pub(crate) fn reshape(&mut self, shape: BlobShape) {
        self.shape = shape;
    }
}

impl Layer for InputLayer {
    fn type_name(&self) -> &'static str {
        "Input"
    }

    fn arity(&self) -> usize {
        0
    }

    fn infer_shape(&mut self, inputs: &[BlobShape]) -> Result<BlobShape, LayerError> {
        if !inputs.is_empty() {
            return Err(LayerError::Shape("input layers take no bottoms".into()));
        }
        if self.shape.is_empty() {
            return Err(LayerError::Shape(format!("empty input shape {}", self.shape)));
        }
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
        _cpu: &CpuContext,
        _inputs: &[&Blob],
        output: &mut Blob,
    ) -> Result<(), LayerError> {
        // Host data was written by set_input.
        output.data().map(|_| ())
    }

    fn forward_gpu(
        &mut self,
        gpu: &GpuRuntime,
        _layer: &str,
        _inputs: &[&Blob],
        output: &mut Blob,
    ) -> Result<(), LayerError> {
        let block = gpu.channel_block_size();
        let packed = nchw_to_padded_nhwc(output.data()?, self.shape, block);
        output.write_to_device(gpu, &packed, packed.len())
    }
}
