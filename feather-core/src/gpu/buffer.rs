use std::{fmt, sync::Arc, sync::mpsc};

use bytemuck::{Pod, bytes_of, cast_slice};
use feather_utils::gpu::GpuBufferPool;

use crate::error::GpuError;

/// Device storage for one tensor, returned to the pool when dropped.
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    elements: usize,
    size_bytes: u64,
    pool: Arc<GpuBufferPool>,
}

impl DeviceBuffer {
    pub(crate) fn acquire(
        pool: &Arc<GpuBufferPool>,
        elements: usize,
        label: &str,
    ) -> Result<Self, GpuError> {
        // Zero-sized bindings are invalid, so keep at least one element.
        let size_bytes = (elements.max(1) * std::mem::size_of::<f32>()) as u64;
        let buffer = pool.acquire(size_bytes, storage_usage(), Some(label))?;
        Ok(Self {
            buffer,
            elements,
            size_bytes,
            pool: Arc::clone(pool),
        })
    }

    /// Number of `f32` values the buffer holds.
    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.pool
            .recycle(self.buffer.clone(), self.size_bytes, storage_usage());
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("elements", &self.elements)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

pub(crate) fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

pub(crate) fn readback_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ
}

pub(crate) fn create_uniform_buffer(
    device: &wgpu::Device,
    label: &str,
    data: &impl Pod,
) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;

    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytes_of(data),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

pub(crate) fn buffer_entry(
    binding: u32,
    ty: wgpu::BufferBindingType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Map `buffer` and copy its first `elements` values out.
///
/// The caller must have submitted the copy into `buffer` already.
pub(crate) fn read_buffer(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    elements: usize,
) -> Result<Vec<f32>, GpuError> {
    let size_bytes = (elements * std::mem::size_of::<f32>()) as u64;
    if size_bytes == 0 {
        return Ok(Vec::new());
    }
    let slice = buffer.slice(0..size_bytes);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| GpuError::Sync(e.to_string()))?;
    receiver
        .recv()
        .map_err(|_| GpuError::Readback("map callback dropped".into()))?
        .map_err(|e| GpuError::Readback(e.to_string()))?;

    let data = slice.get_mapped_range();
    let floats: Vec<f32> = cast_slice(&data).to_vec();
    drop(data);
    buffer.unmap();
    if floats.len() != elements {
        return Err(GpuError::Readback(format!(
            "returned {} elements, expected {elements}",
            floats.len()
        )));
    }
    Ok(floats)
}
