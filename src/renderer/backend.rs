// src/renderer/backend.rs
//! Backend seam between the frame orchestration and the code that executes it

use super::camera::RayGenerator;
use super::settings::RenderSettings;
use crate::aggregation::ActiveVolume;
use crate::error::Result;
use crate::interpreter::InterpreterParams;
use crate::performance::FrameStats;
use crate::shader::{ComposedShader, ShaderVariant};
use crate::transfer_function::{Sampler, TransferFunctionTables};

/// Executes composed ray-marching programs.
///
/// The renderer calls `compile` only when the structural configuration
/// changes, `bind_volumes` and `upload_transfer_function` when their inputs
/// change, and `draw` once per frame with the current program.
pub trait RenderBackend {
    /// Backend-specific compiled program
    type Program;

    fn name(&self) -> &str;

    /// Compile a composed shader. Failure leaves the backend's state untouched.
    fn compile(&mut self, shader: &ComposedShader, variant: &ShaderVariant) -> Result<Self::Program>;

    /// Make `volumes` the bound set, in binding order. Resources of volumes
    /// no longer in the set are released.
    fn bind_volumes(&mut self, volumes: &[ActiveVolume]) -> Result<()>;

    /// Upload the lookup tables for the given sampler
    fn upload_transfer_function(&mut self, tables: &TransferFunctionTables, sampler: Sampler) -> Result<()>;

    fn draw(&mut self, program: &Self::Program, inputs: &FrameInputs<'_>) -> Result<FrameOutput>;

    /// Drop every resource held for the session
    fn release(&mut self);
}

/// Non-structural per-frame inputs
#[derive(Debug, Clone, Copy)]
pub struct FrameInputs<'a> {
    pub rays: &'a RayGenerator,
    pub settings: &'a RenderSettings,
    pub interpreter_params: InterpreterParams,
}

/// Result of one draw
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub frame: FrameBuffer,
    pub stats: FrameStats,
}

/// Composited RGBA pixels (color weighted by coverage), row-major with row 0 at the top
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl FrameBuffer {
    /// Buffer filled with one color
    pub fn filled(width: u32, height: u32, color: [f32; 4]) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    /// Wrap existing pixels; `None` if the length does not match the size
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<[f32; 4]>) -> Option<Self> {
        (pixels.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    pub(crate) fn set(&mut self, x: u32, y: u32, color: [f32; 4]) {
        let index = (y * self.width + x) as usize;
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    /// 8-bit RGBA, e.g. for writing an image file
    pub fn to_rgba8(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .flat_map(|p| p.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_access() {
        let mut frame = FrameBuffer::filled(2, 2, [0.0, 0.0, 0.0, 1.0]);
        frame.set(1, 0, [1.0, 0.5, 0.0, 1.0]);
        assert_eq!(frame.pixel(1, 0), Some([1.0, 0.5, 0.0, 1.0]));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(&frame.to_rgba8()[4..8], &[255, 128, 0, 255]);
        assert!(FrameBuffer::from_pixels(2, 2, vec![[0.0; 4]; 3]).is_none());
    }
}
