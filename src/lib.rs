// src/lib.rs
//! Volren
//!
//! A multi-volume ray-marching core built on wgpu. Several co-registered
//! scalar volumes are combined per sample by an aggregation rule, classified
//! through a transfer function and turned into pixels by a volume
//! interpreter. Interpreter, sampler and aggregation rule are all swappable at
//! runtime; the renderer rebuilds its program only when one of them, or the
//! set of bound volumes, changes.
//!
//! [`renderer::CpuBackend`] runs the identical pipeline in software and is
//! what the test suite renders with; [`renderer::WgpuBackend`] dispatches the
//! composed WGSL as a compute shader.

pub mod aggregation;
pub mod error;
pub mod interpreter;
pub mod math;
pub mod performance;
pub mod prelude;
pub mod renderer;
pub mod shader;
pub mod transfer_function;
pub mod volume;
pub mod wgpu_utils;

pub use error::{Result, VolumeRenderError};
pub use renderer::MultiVolumeRenderer;

/// Renderer on the software backend with default settings
pub fn cpu_renderer() -> Result<MultiVolumeRenderer<renderer::CpuBackend>> {
    MultiVolumeRenderer::new(renderer::CpuBackend::new(), renderer::RenderSettings::default())
}
