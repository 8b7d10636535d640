// src/renderer/gpu.rs
//! wgpu compute backend
//!
//! Each composed shader becomes one compute pipeline. Volumes are uploaded as
//! R32Float 3D textures and cached by `(id, revision)`, the transfer function
//! lives in two read-only storage buffers, and every frame is dispatched into
//! an Rgba32Float storage image that is copied back for the [`FrameBuffer`].

use super::backend::{FrameBuffer, FrameInputs, FrameOutput, RenderBackend};
use super::raymarch::Field;
use super::MAX_BOUND_VOLUMES;
use crate::aggregation::ActiveVolume;
use crate::error::{Result, VolumeRenderError};
use crate::performance::FrameStats;
use crate::shader::{ComposedShader, ShaderVariant, ENTRY_POINT, WORKGROUP_SIZE};
use crate::transfer_function::{Sampler, TransferFunctionTables};
use crate::volume::{Volume, VolumeId};
use crate::wgpu_utils::{
    align_to, binding_types, ArrayBuffer, BindGroupBuilder, BindGroupLayoutBuilder,
    BindGroupLayoutWithDesc, UniformBuffer,
};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;

const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
const OUTPUT_TEXEL_BYTES: u32 = 16;

/// Mirrors `FrameUniforms` in the shader header
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    inv_view_proj: [[f32; 4]; 4],
    background: [f32; 4],
    iso_color: [f32; 4],
    bounds_min: [f32; 4],
    bounds_max: [f32; 4],
    viewport: [u32; 2],
    max_steps: u32,
    table_size: u32,
    step_size: f32,
    termination_threshold: f32,
    iso_value: f32,
    domain_min: f32,
    domain_max: f32,
    _pad: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VolumeSlot {
    world_to_voxel: [[f32; 4]; 4],
    /// x = aggregation weight
    params: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VolumeUniforms {
    slots: [VolumeSlot; MAX_BOUND_VOLUMES],
}

/// Compute pipeline for one variant
pub struct WgpuProgram {
    key: String,
    variant: ShaderVariant,
    pipeline: wgpu::ComputePipeline,
    layout: BindGroupLayoutWithDesc,
}

impl WgpuProgram {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn variant(&self) -> &ShaderVariant {
        &self.variant
    }
}

struct VolumeTexture {
    revision: u64,
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct TransferTables {
    regular: ArrayBuffer<[f32; 4]>,
    segments: ArrayBuffer<[f32; 4]>,
    size: usize,
    domain: (f32, f32),
}

struct OutputTarget {
    width: u32,
    height: u32,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    staging: ArrayBuffer<u8>,
    padded_bytes_per_row: u32,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    frame_uniforms: UniformBuffer<FrameUniforms>,
    volume_uniforms: UniformBuffer<VolumeUniforms>,
    textures: HashMap<VolumeId, VolumeTexture>,
    bound: Vec<ActiveVolume>,
    tables: Option<TransferTables>,
    target: Option<OutputTarget>,
    compiled: u64,
}

impl WgpuBackend {
    /// Headless backend on the default high-performance adapter
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| VolumeRenderError::gpu("request_adapter", e))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("volren device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| VolumeRenderError::gpu("request_device", e))?;

        let info = adapter.get_info();
        log::info!("Using adapter {} ({:?})", info.name, info.backend);
        Ok(Self::with_adapter_name(device, queue, info.name))
    }

    /// Backend on an existing device, e.g. one shared with a presentation surface
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self::with_adapter_name(device, queue, "external device".to_string())
    }

    fn with_adapter_name(device: wgpu::Device, queue: wgpu::Queue, adapter_name: String) -> Self {
        let frame_uniforms = UniformBuffer::new(&device);
        let volume_uniforms = UniformBuffer::new(&device);
        Self {
            device,
            queue,
            adapter_name,
            frame_uniforms,
            volume_uniforms,
            textures: HashMap::new(),
            bound: Vec::new(),
            tables: None,
            target: None,
            compiled: 0,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Number of successful pipeline compilations
    pub fn compiled_programs(&self) -> u64 {
        self.compiled
    }

    /// Number of volume textures resident on the device
    pub fn resident_textures(&self) -> usize {
        self.textures.len()
    }

    fn bind_group_layout(&self, volume_count: usize, label: &str) -> BindGroupLayoutWithDesc {
        let mut builder = BindGroupLayoutBuilder::new()
            .next_binding_compute(binding_types::uniform())
            .next_binding_compute(binding_types::uniform())
            .next_binding_compute(binding_types::storage_buffer_read_only())
            .next_binding_compute(binding_types::storage_buffer_read_only())
            .next_binding_compute(binding_types::image_2d(
                OUTPUT_FORMAT,
                wgpu::StorageTextureAccess::WriteOnly,
            ));
        for _ in 0..volume_count {
            builder = builder.next_binding_compute(binding_types::texture_3d_unfilterable());
        }
        builder.create(&self.device, label)
    }

    fn upload_volume(&self, id: VolumeId, revision: u64, volume: &Volume) -> Result<VolumeTexture> {
        let [width, height, depth] = volume.dimensions();
        let max = self.device.limits().max_texture_dimension_3d;
        if width > max || height > max || depth > max {
            return Err(VolumeRenderError::gpu(
                "upload_volume",
                format!("{} is {}x{}x{}, device limit is {}", id, width, height, depth, max),
            ));
        }

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(volume.label()),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(volume.scalars()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );
        log::debug!("Uploaded {} ({}x{}x{}, revision {})", id, width, height, depth, revision);

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(VolumeTexture {
            revision,
            _texture: texture,
            view,
        })
    }

    fn ensure_target(&mut self, width: u32, height: u32) {
        if let Some(target) = &self.target {
            if target.width == width && target.height == height {
                return;
            }
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("raymarch output"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OUTPUT_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let padded_bytes_per_row = align_to(width * OUTPUT_TEXEL_BYTES, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let staging = ArrayBuffer::new_staging(&self.device, (padded_bytes_per_row * height) as usize);

        self.target = Some(OutputTarget {
            width,
            height,
            texture,
            view,
            staging,
            padded_bytes_per_row,
        });
    }

    fn read_target(&self, target: &OutputTarget) -> Result<Vec<[f32; 4]>> {
        let slice = target.staging.buffer().slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| VolumeRenderError::gpu("poll", e))?;

        match pollster::block_on(rx) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(VolumeRenderError::gpu("map_async", e)),
            Err(_) => return Err(VolumeRenderError::gpu("map_async", "mapping callback dropped")),
        }

        let row_bytes = (target.width * OUTPUT_TEXEL_BYTES) as usize;
        let mut pixels = Vec::with_capacity((target.width * target.height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(target.padded_bytes_per_row as usize) {
                let texels: &[[f32; 4]] = bytemuck::cast_slice(&row[..row_bytes]);
                pixels.extend_from_slice(texels);
            }
        }
        target.staging.buffer().unmap();
        Ok(pixels)
    }
}

impl RenderBackend for WgpuBackend {
    type Program = WgpuProgram;

    fn name(&self) -> &str {
        "wgpu"
    }

    fn compile(&mut self, shader: &ComposedShader, variant: &ShaderVariant) -> Result<WgpuProgram> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&shader.label),
            source: wgpu::ShaderSource::Wgsl(shader.source.as_str().into()),
        });
        let layout = self.bind_group_layout(variant.volume_count(), &shader.label);
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&shader.label),
            bind_group_layouts: &[&layout.layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&shader.label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(VolumeRenderError::ShaderCompilation {
                label: shader.label.clone(),
                message: error.to_string(),
            });
        }

        self.compiled += 1;
        log::debug!("Compiled compute pipeline {}", shader.key);
        Ok(WgpuProgram {
            key: shader.key.clone(),
            variant: variant.clone(),
            pipeline,
            layout,
        })
    }

    fn bind_volumes(&mut self, volumes: &[ActiveVolume]) -> Result<()> {
        if volumes.len() > MAX_BOUND_VOLUMES {
            return Err(VolumeRenderError::TooManyVolumes {
                count: volumes.len(),
                max: MAX_BOUND_VOLUMES,
            });
        }

        for active in volumes {
            let stale = self
                .textures
                .get(&active.id)
                .map_or(true, |cached| cached.revision != active.revision);
            if stale {
                let texture = self.upload_volume(active.id, active.revision, &active.volume)?;
                self.textures.insert(active.id, texture);
            }
        }

        let before = self.textures.len();
        self.textures.retain(|id, _| volumes.iter().any(|v| v.id == *id));
        if self.textures.len() < before {
            log::debug!("Released {} volume texture(s)", before - self.textures.len());
        }

        self.bound = volumes.to_vec();
        Ok(())
    }

    fn upload_transfer_function(&mut self, tables: &TransferFunctionTables, sampler: Sampler) -> Result<()> {
        let regular = tables.regular_texels();
        let segments = match sampler {
            Sampler::Regular => vec![[0.0; 4]],
            Sampler::PreIntegrated => tables
                .segment_texels()
                .map(|texels| texels.to_vec())
                .unwrap_or_else(|| tables.compute_segment_texels()),
        };

        let limits = self.device.limits();
        check_table_fits("regular transfer table", &regular, &limits)?;
        check_table_fits("segment transfer table", &segments, &limits)?;

        let reused = match self.tables.as_mut() {
            Some(current) => {
                let fits = current.regular.update_data(&self.queue, &regular)
                    && current.segments.update_data(&self.queue, &segments);
                if fits {
                    current.size = tables.size();
                    current.domain = tables.domain();
                }
                fits
            }
            None => false,
        };
        if !reused {
            self.tables = Some(TransferTables {
                regular: ArrayBuffer::new_with_data(&self.device, &regular),
                segments: ArrayBuffer::new_with_data(&self.device, &segments),
                size: tables.size(),
                domain: tables.domain(),
            });
        }
        log::debug!("Uploaded {}-entry {} transfer function", tables.size(), sampler.label());
        Ok(())
    }

    fn draw(&mut self, program: &WgpuProgram, inputs: &FrameInputs<'_>) -> Result<FrameOutput> {
        let bound: Vec<VolumeId> = self.bound.iter().map(|v| v.id).collect();
        if bound != program.variant.volumes {
            return Err(VolumeRenderError::NoRenderableState {
                reason: format!("program {} does not match the bound volumes", program.key),
            });
        }
        let (table_size, domain) = match &self.tables {
            Some(tables) => (tables.size, tables.domain),
            None => {
                return Err(VolumeRenderError::NoRenderableState {
                    reason: "no transfer function uploaded".into(),
                })
            }
        };

        let viewport = inputs.rays.viewport();
        self.ensure_target(viewport.width, viewport.height);

        let field = Field::new(&self.bound, &program.variant.aggregation)?;
        let (bounds_min, bounds_max) = match field.bounds() {
            Some(b) => ([b.min.x, b.min.y, b.min.z, 0.0], [b.max.x, b.max.y, b.max.z, 0.0]),
            None => ([0.0; 4], [0.0; 4]),
        };
        let settings = inputs.settings;
        let params = inputs.interpreter_params;
        self.frame_uniforms.update_content(
            &self.queue,
            FrameUniforms {
                inv_view_proj: (*inputs.rays.inverse_view_projection()).into(),
                background: settings.background.into(),
                iso_color: params.iso_color.into(),
                bounds_min,
                bounds_max,
                viewport: [viewport.width, viewport.height],
                max_steps: settings.max_steps,
                table_size: table_size as u32,
                step_size: settings.step_size,
                // The shader compares with >=, so a disabled threshold must stay finite.
                termination_threshold: params.termination_threshold.min(f32::MAX),
                iso_value: params.iso_value,
                domain_min: domain.0,
                domain_max: domain.1,
                _pad: [0.0; 3],
            },
        );

        let mut slots = [VolumeSlot::zeroed(); MAX_BOUND_VOLUMES];
        for (slot, active) in slots.iter_mut().zip(&self.bound) {
            slot.world_to_voxel = (*active.volume.inverse_transform()).into();
            slot.params = [active.weight, 0.0, 0.0, 0.0];
        }
        self.volume_uniforms
            .update_content(&self.queue, VolumeUniforms { slots });

        let (Some(tables), Some(target)) = (&self.tables, &self.target) else {
            return Err(VolumeRenderError::gpu("draw", "frame resources missing"));
        };
        let mut builder = BindGroupBuilder::new(&program.layout)
            .resource(self.frame_uniforms.binding_resource())
            .resource(self.volume_uniforms.binding_resource())
            .resource(tables.regular.binding_resource())
            .resource(tables.segments.binding_resource())
            .texture(&target.view);
        for active in &self.bound {
            let cached = self.textures.get(&active.id).ok_or_else(|| {
                VolumeRenderError::gpu("draw", format!("{} has no resident texture", active.id))
            })?;
            builder = builder.texture(&cached.view);
        }
        if builder.remaining() != 0 {
            return Err(VolumeRenderError::gpu("draw", "bind group is incomplete"));
        }
        let bind_group = builder.create(&self.device, &program.key);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("raymarch encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("raymarch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                viewport.width.div_ceil(WORKGROUP_SIZE),
                viewport.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: target.staging.buffer(),
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(target.padded_bytes_per_row),
                    rows_per_image: Some(viewport.height),
                },
            },
            wgpu::Extent3d {
                width: viewport.width,
                height: viewport.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let pixels = self.read_target(target)?;
        let frame = FrameBuffer::from_pixels(viewport.width, viewport.height, pixels)
            .ok_or_else(|| VolumeRenderError::gpu("readback", "pixel count does not match the viewport"))?;

        Ok(FrameOutput {
            frame,
            stats: FrameStats {
                rays: viewport.pixel_count() as u64,
                samples: 0,
                terminated_rays: 0,
            },
        })
    }

    fn release(&mut self) {
        self.textures.clear();
        self.bound.clear();
        self.tables = None;
        self.target = None;
        log::debug!("Released GPU resources on {}", self.adapter_name);
    }
}

/// Storage buffers past the device's binding or buffer limits fail validation
fn check_table_fits(label: &str, texels: &[[f32; 4]], limits: &wgpu::Limits) -> Result<()> {
    let bytes = std::mem::size_of_val(texels) as u64;
    let max = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
    if bytes > max {
        return Err(VolumeRenderError::gpu(
            "upload_transfer_function",
            format!("{} needs {} bytes but the device allows {}", label, bytes, max),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layouts_match_shader() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 176);
        assert_eq!(std::mem::size_of::<VolumeSlot>(), 80);
        assert_eq!(std::mem::size_of::<VolumeUniforms>(), 320);
    }

    #[test]
    fn test_oversized_segment_table_is_rejected() {
        let limits = wgpu::Limits::default();
        let small = vec![[0.0f32; 4]; 256 * 256];
        assert!(check_table_fits("segments", &small, &limits).is_ok());

        // 4096 x 4096 RGBA32F is 256 MiB, past the default 128 MiB binding limit.
        let entries = (limits.max_storage_buffer_binding_size as usize / 16) + 1;
        let large = vec![[0.0f32; 4]; entries];
        let err = check_table_fits("segments", &large, &limits).expect_err("too large");
        assert!(matches!(err, VolumeRenderError::GpuOperation { .. }));
    }
}
