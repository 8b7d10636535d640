// src/renderer/settings.rs
//! Per-renderer configuration record

use crate::error::{Result, VolumeRenderError};
use crate::math::Rgba;
use crate::transfer_function::{DEFAULT_TABLE_SIZE, MAX_TABLE_SIZE};
use cgmath::Vector4;

/// Ray-marching parameters read once per frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    /// World-space distance between ray samples
    pub step_size: f32,
    /// Accumulated opacity at which transparent rays stop
    pub termination_threshold: f32,
    pub early_ray_termination: bool,
    /// Straight-alpha color behind the volumes
    pub background: Rgba,
    /// Upper bound on steps per ray
    pub max_steps: u32,
    /// Entries in the transfer-function lookup table
    pub table_size: usize,
    /// Iso-value used until the first `set_iso_value`
    pub iso_value: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            termination_threshold: 0.99,
            early_ray_termination: true,
            background: Vector4::new(0.0, 0.0, 0.0, 0.0),
            max_steps: 2048,
            table_size: DEFAULT_TABLE_SIZE,
            iso_value: 0.5,
        }
    }
}

impl RenderSettings {
    pub fn with_step_size(mut self, step_size: f32) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_termination_threshold(mut self, threshold: f32) -> Self {
        self.termination_threshold = threshold;
        self
    }

    pub fn with_early_ray_termination(mut self, enabled: bool) -> Self {
        self.early_ray_termination = enabled;
        self
    }

    pub fn with_background(mut self, background: Rgba) -> Self {
        self.background = background;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_table_size(mut self, table_size: usize) -> Self {
        self.table_size = table_size;
        self
    }

    pub fn with_iso_value(mut self, iso_value: f32) -> Self {
        self.iso_value = iso_value;
        self
    }

    /// Opacity threshold handed to the interpreter; disabled termination never fires
    pub fn effective_threshold(&self) -> f32 {
        if self.early_ray_termination {
            self.termination_threshold
        } else {
            f32::INFINITY
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str| {
            Err(VolumeRenderError::InvalidSettings {
                field: field.to_string(),
            })
        };
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            return invalid("step_size must be finite and positive");
        }
        if !(self.termination_threshold > 0.0 && self.termination_threshold <= 1.0) {
            return invalid("termination_threshold must be in (0, 1]");
        }
        let b = self.background;
        if [b.x, b.y, b.z, b.w].iter().any(|c| !(0.0..=1.0).contains(c)) {
            return invalid("background channels must be in [0, 1]");
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be non-zero");
        }
        if !(2..=MAX_TABLE_SIZE).contains(&self.table_size) {
            return invalid("table_size must be in [2, 4096]");
        }
        if !self.iso_value.is_finite() {
            return invalid("iso_value must be finite");
        }
        Ok(())
    }
}
