// src/wgpu_utils/uniform_buffer.rs
//! Typed GPU buffers
use std::marker::PhantomData;

fn short_type_name<T>() -> &'static str {
    let type_name = std::any::type_name::<T>();
    match type_name.rfind(':') {
        Some(pos) => &type_name[(pos + 1)..],
        None => type_name,
    }
}

/// Uniform buffer holding one `Content`; writes are skipped when the bytes are unchanged
pub struct UniformBuffer<Content> {
    buffer: wgpu::Buffer,
    content_type: PhantomData<Content>,
    previous_content: Vec<u8>,
}

impl<Content: bytemuck::Pod> UniformBuffer<Content> {
    pub fn new(device: &wgpu::Device) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("UniformBuffer: {}", short_type_name::<Content>())),
            size: std::mem::size_of::<Content>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        UniformBuffer {
            buffer,
            content_type: PhantomData,
            previous_content: Vec::new(),
        }
    }

    /// Queue a write if the content differs from the last one. Returns whether a write happened.
    pub fn update_content(&mut self, queue: &wgpu::Queue, content: Content) -> bool {
        let new_content = bytemuck::bytes_of(&content);
        if self.previous_content == new_content {
            return false;
        }
        queue.write_buffer(&self.buffer, 0, new_content);
        self.previous_content = new_content.to_vec();
        true
    }

    pub fn binding_resource(&self) -> wgpu::BindingResource {
        self.buffer.as_entire_binding()
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// Buffer of `Content` elements: a read-only storage array or a readback staging area
pub struct ArrayBuffer<Content> {
    buffer: wgpu::Buffer,
    content_type: PhantomData<Content>,
    capacity: usize,
    current_size: usize,
}

impl<Content: bytemuck::Pod> ArrayBuffer<Content> {
    /// Read-only storage buffer initialised with `data`
    pub fn new_with_data(device: &wgpu::Device, data: &[Content]) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("ArrayBuffer<{}>", short_type_name::<Content>())),
            size: std::mem::size_of_val(data).max(std::mem::size_of::<Content>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: true,
        });

        {
            let mut mapped = buffer.slice(..).get_mapped_range_mut();
            let bytes: &[u8] = bytemuck::cast_slice(data);
            mapped[..bytes.len()].copy_from_slice(bytes);
        }
        buffer.unmap();

        ArrayBuffer {
            buffer,
            content_type: PhantomData,
            capacity: data.len().max(1),
            current_size: data.len(),
        }
    }

    /// Mappable buffer for reading GPU results back
    pub fn new_staging(device: &wgpu::Device, capacity: usize) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("StagingBuffer<{}>", short_type_name::<Content>())),
            size: (capacity * std::mem::size_of::<Content>()) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        ArrayBuffer {
            buffer,
            content_type: PhantomData,
            capacity,
            current_size: capacity,
        }
    }

    /// Overwrite the contents in place. Returns `false` without writing if
    /// `data` does not fit; the caller recreates the buffer then.
    pub fn update_data(&mut self, queue: &wgpu::Queue, data: &[Content]) -> bool {
        if data.len() > self.capacity {
            return false;
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        self.current_size = data.len();
        true
    }

    pub fn binding_resource(&self) -> wgpu::BindingResource {
        self.buffer.as_entire_binding()
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.current_size
    }

    pub fn is_empty(&self) -> bool {
        self.current_size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<crate::volume::VolumeId>(), "VolumeId");
        assert_eq!(short_type_name::<u8>(), "u8");
    }
}
