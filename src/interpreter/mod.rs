// src/interpreter/mod.rs
//! # Volume Interpreters
//!
//! A [`VolumeInterpreter`] decides what a ray sample means for the pixel:
//!
//! - [`VolumeInterpreter::Transparent`] composites samples front to back and
//!   stops once the accumulated opacity reaches the termination threshold.
//! - [`VolumeInterpreter::IsoSurface`] looks for the first crossing of the
//!   iso-value, refines it between the two bracketing samples and shades the
//!   hit with a fixed headlight model.
//!
//! Interpreters are stateless. All per-ray state lives in [`RayAccumulator`],
//! so one interpreter value can be shared by every ray of a frame.

use crate::math::{saturate, Ray, Rgba};
use cgmath::{InnerSpace, Vector3, Vector4, Zero};

/// Shading constants for iso-surface hits
pub const ISO_AMBIENT: f32 = 0.2;
pub const ISO_DIFFUSE: f32 = 0.7;
pub const ISO_SPECULAR: f32 = 0.3;
pub const ISO_SHININESS: f32 = 32.0;

/// Gradients shorter than this are treated as zero
const MIN_GRADIENT_LENGTH: f32 = 1e-8;

/// Ray-sample interpretation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VolumeInterpreter {
    #[default]
    Transparent,
    IsoSurface,
}

impl VolumeInterpreter {
    /// Short identifier used in shader labels and logs
    pub fn label(self) -> &'static str {
        match self {
            VolumeInterpreter::Transparent => "transparent",
            VolumeInterpreter::IsoSurface => "isosurface",
        }
    }

    /// Whether every step needs a transfer-function sample
    pub fn samples_transfer_function(self) -> bool {
        matches!(self, VolumeInterpreter::Transparent)
    }

    /// Consume one ray sample
    pub fn consume(
        self,
        acc: &mut RayAccumulator,
        sample: &SampleContext<'_>,
        params: &InterpreterParams,
    ) -> StepOutcome {
        acc.steps += 1;
        match self {
            VolumeInterpreter::Transparent => composite(acc, sample.color, params),
            VolumeInterpreter::IsoSurface => detect_surface(acc, sample, params),
        }
    }
}

/// Per-frame constants shared by all rays
#[derive(Debug, Clone, Copy)]
pub struct InterpreterParams {
    pub iso_value: f32,
    /// Transfer-function color at the iso-value; base color of the surface
    pub iso_color: Rgba,
    pub termination_threshold: f32,
}

/// The previous sample along a ray
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviousSample {
    pub t: f32,
    pub intensity: f32,
}

/// Everything an interpreter may look at for one ray step
pub struct SampleContext<'a> {
    pub ray: &'a Ray,
    /// Distance of the sample along the ray
    pub t: f32,
    pub intensity: f32,
    pub previous: Option<PreviousSample>,
    /// Transfer-function result for this step (unused by iso-surfaces)
    pub color: Rgba,
    /// Gradient estimator for the combined field at a world position
    pub gradient: &'a dyn Fn(Vector3<f32>) -> Vector3<f32>,
}

/// What the marcher should do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Terminate,
}

/// Refined iso-surface intersection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceHit {
    pub t: f32,
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
}

/// Per-ray accumulation state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayAccumulator {
    /// Opacity-weighted color accumulated so far
    pub color: Vector3<f32>,
    pub alpha: f32,
    pub surface: Option<SurfaceHit>,
    pub steps: u32,
}

impl RayAccumulator {
    pub fn new() -> Self {
        Self {
            color: Vector3::zero(),
            alpha: 0.0,
            surface: None,
            steps: 0,
        }
    }

    /// Blend the accumulated color over a background
    pub fn resolve(&self, background: Rgba) -> Rgba {
        let remaining = 1.0 - self.alpha;
        saturate(Vector4::new(
            self.color.x + remaining * background.x * background.w,
            self.color.y + remaining * background.y * background.w,
            self.color.z + remaining * background.z * background.w,
            self.alpha + remaining * background.w,
        ))
    }
}

impl Default for RayAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn composite(acc: &mut RayAccumulator, color: Rgba, params: &InterpreterParams) -> StepOutcome {
    let alpha = if color.w.is_nan() { 0.0 } else { color.w.clamp(0.0, 1.0) };
    let weight = (1.0 - acc.alpha) * alpha;
    acc.color += Vector3::new(color.x, color.y, color.z) * weight;
    acc.alpha += weight;

    if acc.alpha >= params.termination_threshold {
        StepOutcome::Terminate
    } else {
        StepOutcome::Continue
    }
}

fn detect_surface(
    acc: &mut RayAccumulator,
    sample: &SampleContext<'_>,
    params: &InterpreterParams,
) -> StepOutcome {
    let d1 = sample.intensity - params.iso_value;
    let t_hit = if d1 == 0.0 {
        sample.t
    } else {
        let Some(previous) = sample.previous else {
            return StepOutcome::Continue;
        };
        let d0 = previous.intensity - params.iso_value;
        let crossed = (d0 < 0.0 && d1 > 0.0) || (d0 > 0.0 && d1 < 0.0);
        if !crossed {
            return StepOutcome::Continue;
        }
        // d0 and d1 have opposite signs, so the denominator is non-zero.
        let frac = d0 / (d0 - d1);
        previous.t + frac * (sample.t - previous.t)
    };

    let position = sample.ray.point_at(t_hit);
    let normal = surface_normal((sample.gradient)(position), sample.ray.direction);
    let shaded = shade(params.iso_color, normal, sample.ray.direction);

    acc.color = Vector3::new(shaded.x, shaded.y, shaded.z);
    acc.alpha = 1.0;
    acc.surface = Some(SurfaceHit {
        t: t_hit,
        position,
        normal,
    });
    StepOutcome::Terminate
}

/// Gradient-derived normal facing the viewer; reversed ray direction if the
/// gradient vanishes
pub fn surface_normal(gradient: Vector3<f32>, ray_direction: Vector3<f32>) -> Vector3<f32> {
    let towards_viewer = -ray_direction;
    let length = gradient.magnitude();
    if !length.is_finite() || length < MIN_GRADIENT_LENGTH {
        return towards_viewer;
    }
    let n = gradient / length;
    if n.dot(towards_viewer) < 0.0 {
        -n
    } else {
        n
    }
}

/// Headlight Blinn-Phong; light and view both point back along the ray
pub fn shade(base: Rgba, normal: Vector3<f32>, ray_direction: Vector3<f32>) -> Rgba {
    let light = -ray_direction;
    let n_dot_l = normal.dot(light).max(0.0);
    // The half vector of identical light and view directions is the light itself.
    let specular = ISO_SPECULAR * n_dot_l.powf(ISO_SHININESS);
    let lit = ISO_AMBIENT + ISO_DIFFUSE * n_dot_l;
    saturate(Vector4::new(
        base.x * lit + specular,
        base.y * lit + specular,
        base.z * lit + specular,
        1.0,
    ))
}
