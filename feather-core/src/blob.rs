//! Tensor storage shared between layers.
//!
//! A [`Blob`] holds one tensor of logical shape `(num, channels, height,
//! width)`. On the CPU backend the data lives in a pooled [`HostBuffer`] in
//! NCHW order. On the GPU backend it lives in a [`DeviceBuffer`] laid out as
//! NHWC with the channel axis padded to the channel block; the host copy is
//! then only a staging area for inputs.

use std::fmt;

use crate::error::{GpuError, LayerError};
use crate::gpu::{DeviceBuffer, GpuRuntime};
use crate::mempool::{HostBuffer, MemPool};

/// Round `channels` up to a multiple of `block`.
pub fn channels_padding(channels: usize, block: usize) -> usize {
    if block <= 1 {
        return channels;
    }
    channels.div_ceil(block) * block
}

/// Logical tensor shape in NCHW order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlobShape {
    pub num: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl BlobShape {
    pub const fn new(num: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            num,
            channels,
            height,
            width,
        }
    }

    /// Number of logical elements.
    pub fn data_size(&self) -> usize {
        self.num * self.channels * self.height * self.width
    }

    /// Elements per image (`channels * height * width`).
    pub fn per_image(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn padded_channels(&self, block: usize) -> usize {
        channels_padding(self.channels, block)
    }

    /// Elements of the padded NHWC device layout.
    pub fn padded_size(&self, block: usize) -> usize {
        self.num * self.height * self.width * self.padded_channels(block)
    }

    pub fn is_empty(&self) -> bool {
        self.data_size() == 0
    }
}

impl fmt::Display for BlobShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}",
            self.num, self.channels, self.height, self.width
        )
    }
}

/// Repack an NCHW host tensor into the padded NHWC device layout.
pub fn nchw_to_padded_nhwc(data: &[f32], shape: BlobShape, block: usize) -> Vec<f32> {
    let cp = shape.padded_channels(block);
    let (c, h, w) = (shape.channels, shape.height, shape.width);
    let mut out = vec![0.0; shape.padded_size(block)];
    for n in 0..shape.num {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    out[((n * h + y) * w + x) * cp + ch] = data[((n * c + ch) * h + y) * w + x];
                }
            }
        }
    }
    out
}

/// Inverse of [`nchw_to_padded_nhwc`], dropping the padded lanes.
pub fn padded_nhwc_to_nchw(data: &[f32], shape: BlobShape, block: usize) -> Vec<f32> {
    let cp = shape.padded_channels(block);
    let (c, h, w) = (shape.channels, shape.height, shape.width);
    let mut out = vec![0.0; shape.data_size()];
    for n in 0..shape.num {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    out[((n * c + ch) * h + y) * w + x] = data[((n * h + y) * w + x) * cp + ch];
                }
            }
        }
    }
    out
}

/// One tensor in the graph.
pub struct Blob {
    name: String,
    shape: BlobShape,
    host: Option<HostBuffer>,
    device: Option<DeviceBuffer>,
    released: bool,
}

impl Blob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: BlobShape::default(),
            host: None,
            device: None,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn shape(&self) -> BlobShape {
        self.shape
    }

    pub(crate) fn set_shape(&mut self, shape: BlobShape) {
        self.shape = shape;
    }

    /// Logical element count, `num * channels * height * width`.
    pub fn data_size(&self) -> usize {
        self.shape.data_size()
    }

    /// Make sure host storage holds at least `size` elements.
    ///
    /// A second call with an equal or smaller size keeps the current buffer.
    pub fn alloc(&mut self, pool: &mut MemPool, size: usize) {
        self.released = false;
        if let Some(host) = &mut self.host
            && host.capacity() >= size
        {
            host.set_len(size);
            return;
        }
        if let Some(old) = self.host.take() {
            pool.release_buffer(old);
        }
        self.host = Some(pool.get_buffer(size));
    }

    /// Hand the host buffer back to the pool and mark the contents as gone.
    pub fn release_host(&mut self, pool: &mut MemPool) {
        if let Some(host) = self.host.take() {
            pool.release_buffer(host);
            self.released = true;
        }
    }

    /// Make sure device storage holds at least `elements` values.
    ///
    /// A second call with an equal or smaller size keeps the current buffer.
    pub fn alloc_device(&mut self, gpu: &GpuRuntime, elements: usize) -> Result<(), GpuError> {
        self.released = false;
        if let Some(device) = &self.device
            && device.elements() >= elements
        {
            return Ok(());
        }
        self.device = None;
        let label = format!("feather_blob_{}", self.name);
        self.device = Some(gpu.alloc_buffer(elements, &label)?);
        Ok(())
    }

    /// Release device storage. Safe to call when nothing is allocated.
    pub fn free(&mut self) {
        if self.device.take().is_some() {
            self.released = true;
        }
    }

    /// Host contents. Fails when no host storage was allocated.
    pub fn data(&self) -> Result<&[f32], LayerError> {
        self.host
            .as_ref()
            .map(HostBuffer::as_slice)
            .ok_or_else(|| LayerError::Unallocated(self.name.clone()))
    }

    pub fn data_mut(&mut self) -> Result<&mut [f32], LayerError> {
        let name = &self.name;
        self.host
            .as_mut()
            .map(HostBuffer::as_mut_slice)
            .ok_or_else(|| LayerError::Unallocated(name.clone()))
    }

    /// Device storage. Fails when no device storage was allocated.
    pub fn device_buffer(&self) -> Result<&DeviceBuffer, LayerError> {
        self.device
            .as_ref()
            .ok_or_else(|| LayerError::Unallocated(self.name.clone()))
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Identity of the pooled host allocation, if any.
    pub fn host_buffer_id(&self) -> Option<usize> {
        self.host.as_ref().map(HostBuffer::id)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Upload the first `count` values of `host` into device storage.
    pub fn write_to_device(
        &self,
        gpu: &GpuRuntime,
        host: &[f32],
        count: usize,
    ) -> Result<(), LayerError> {
        let device = self.device_buffer()?;
        if count > host.len() || count > device.elements() {
            return Err(LayerError::Shape(format!(
                "cannot write {count} values into blob '{}' ({} host values, {} device slots)",
                self.name,
                host.len(),
                device.elements()
            )));
        }
        gpu.write_buffer(device, &host[..count]);
        Ok(())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("host", &self.host.as_ref().map(HostBuffer::id))
            .field("device", &self.device.as_ref().map(DeviceBuffer::elements))
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_padding_rounds_up_to_block() {
        for block in 1..=8usize {
            for channels in 0..=33usize {
                let padded = channels_padding(channels, block);
                assert_eq!(padded, channels.div_ceil(block) * block);
                assert!(padded >= channels);
                assert!(padded - channels < block);
            }
        }
    }

    #[test]
    fn layout_conversion_keeps_padded_lanes_zero() {
        let shape = BlobShape::new(1, 3, 2, 2);
        let data: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        let packed = nchw_to_padded_nhwc(&data, shape, 4);
        assert_eq!(packed.len(), shape.padded_size(4));
        for pixel in packed.chunks(4) {
            assert_eq!(pixel[3], 0.0);
        }
        assert_eq!(&packed[..4], &[1.0, 5.0, 9.0, 0.0]);
        assert_eq!(padded_nhwc_to_nchw(&packed, shape, 4), data);
    }

    #[test]
    fn alloc_is_idempotent_for_smaller_sizes() {
        let mut pool = MemPool::new();
        let mut blob = Blob::new("x");
        blob.alloc(&mut pool, 16);
        let id = blob.host_buffer_id();
        blob.alloc(&mut pool, 8);
        assert_eq!(blob.host_buffer_id(), id);
        assert_eq!(blob.data().expect("host data").len(), 8);

        blob.alloc(&mut pool, 32);
        assert_ne!(blob.host_buffer_id(), id);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn unallocated_accessors_fail() {
        let mut blob = Blob::new("empty");
        assert!(matches!(blob.data(), Err(LayerError::Unallocated(name)) if name == "empty"));
        assert!(blob.device_buffer().is_err());
        blob.free();
        blob.free();
        assert!(!blob.is_released());
    }

    #[test]
    fn release_marks_blob_and_returns_buffer() {
        let mut pool = MemPool::new();
        let mut blob = Blob::new("tmp");
        blob.alloc(&mut pool, 4);
        blob.release_host(&mut pool);
        assert!(blob.is_released());
        assert!(!blob.has_host());
        assert_eq!(pool.stats().free, 1);
        blob.alloc(&mut pool, 4);
        assert!(!blob.is_released());
        assert_eq!(pool.stats().reuses, 1);
    }
}
