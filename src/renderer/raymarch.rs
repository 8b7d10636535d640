// src/renderer/raymarch.rs
//! Per-ray marching through the aggregated field
//!
//! This is the software counterpart of the composed WGSL entry point. Each
//! step samples every bound volume, folds the samples with the aggregation
//! rule, runs the active sampler and hands the result to the interpreter.

use super::MAX_BOUND_VOLUMES;
use crate::aggregation::{ActiveVolume, AggregationRule, ChannelSample};
use crate::error::{Result, VolumeRenderError};
use crate::interpreter::{
    InterpreterParams, PreviousSample, RayAccumulator, SampleContext, StepOutcome,
    VolumeInterpreter,
};
use crate::math::{Aabb, Ray};
use crate::transfer_function::{Sampler, TransferFunctionTables};
use crate::volume::VolumeId;
use cgmath::{Vector3, Zero};

/// The combined scalar field of the bound volumes
pub struct Field<'a> {
    volumes: &'a [ActiveVolume],
    rule: &'a AggregationRule,
    bounds: Option<Aabb>,
}

impl<'a> Field<'a> {
    pub fn new(volumes: &'a [ActiveVolume], rule: &'a AggregationRule) -> Result<Self> {
        if volumes.len() > MAX_BOUND_VOLUMES {
            return Err(VolumeRenderError::TooManyVolumes {
                count: volumes.len(),
                max: MAX_BOUND_VOLUMES,
            });
        }
        let bounds = volumes
            .iter()
            .map(|v| v.volume.world_bounds())
            .reduce(|a, b| a.union(&b));
        Ok(Self {
            volumes,
            rule,
            bounds,
        })
    }

    /// Union of the world bounds of all bound volumes
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    /// Aggregated value at a world position; `None` where nothing contributes
    pub fn sample(&self, p: Vector3<f32>) -> Option<f32> {
        let mut samples = [ChannelSample {
            id: VolumeId(0),
            value: 0.0,
            weight: 0.0,
        }; MAX_BOUND_VOLUMES];
        let mut count = 0;
        for active in self.volumes {
            if let Some(value) = active.volume.sample_world(p) {
                samples[count] = ChannelSample {
                    id: active.id,
                    value,
                    weight: active.weight,
                };
                count += 1;
            }
        }
        self.rule.combine(&samples[..count])
    }

    /// Central-difference gradient with spacing `h`.
    ///
    /// Neighbors outside the field reuse the center value.
    pub fn gradient(&self, p: Vector3<f32>, h: f32) -> Vector3<f32> {
        let center = self.sample(p).unwrap_or(0.0);
        let at = |offset: Vector3<f32>| self.sample(p + offset).unwrap_or(center);
        let dx = Vector3::new(h, 0.0, 0.0);
        let dy = Vector3::new(0.0, h, 0.0);
        let dz = Vector3::new(0.0, 0.0, h);
        Vector3::new(at(dx) - at(-dx), at(dy) - at(-dy), at(dz) - at(-dz)) / (2.0 * h)
    }
}

/// Per-frame marching parameters
#[derive(Debug, Clone, Copy)]
pub struct MarchParams<'a> {
    pub step_size: f32,
    pub max_steps: u32,
    pub interpreter: VolumeInterpreter,
    pub sampler: Sampler,
    pub tables: &'a TransferFunctionTables,
    pub interpreter_params: InterpreterParams,
}

/// Outcome of marching one ray
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayResult {
    pub accumulator: RayAccumulator,
    /// Steps that found at least one volume
    pub samples: u32,
    /// The interpreter stopped the ray before it left the field
    pub terminated: bool,
}

/// March one ray front to back through the field
pub fn march_ray(field: &Field<'_>, ray: &Ray, params: &MarchParams<'_>) -> RayResult {
    let mut result = RayResult {
        accumulator: RayAccumulator::new(),
        samples: 0,
        terminated: false,
    };
    let Some((t_near, t_far)) = field.bounds().and_then(|b| b.intersect_ray(ray)) else {
        return result;
    };

    let gradient = |p: Vector3<f32>| field.gradient(p, params.step_size);
    let mut previous: Option<PreviousSample> = None;

    for i in 0..params.max_steps {
        let t = t_near + i as f32 * params.step_size;
        if t > t_far {
            break;
        }
        let Some(intensity) = field.sample(ray.point_at(t)) else {
            previous = None;
            continue;
        };
        result.samples += 1;

        let color = if params.interpreter.samples_transfer_function() {
            params
                .sampler
                .sample(params.tables, previous.map(|s| s.intensity), intensity)
        } else {
            cgmath::Vector4::zero()
        };
        let context = SampleContext {
            ray,
            t,
            intensity,
            previous,
            color,
            gradient: &gradient,
        };
        if params
            .interpreter
            .consume(&mut result.accumulator, &context, &params.interpreter_params)
            == StepOutcome::Terminate
        {
            result.terminated = true;
            break;
        }
        previous = Some(PreviousSample { t, intensity });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer_function::TransferFunction;
    use crate::volume::Volume;
    use cgmath::{Matrix4, SquareMatrix, Vector4};
    use std::sync::Arc;

    fn active(id: u32, value: f32, transform: Matrix4<f32>) -> ActiveVolume {
        ActiveVolume {
            id: VolumeId(id),
            revision: 1,
            volume: Arc::new(Volume::scalar("uniform", [2, 2, 2], vec![value; 8], transform).expect("valid volume")),
            weight: 1.0,
        }
    }

    fn params<'a>(tables: &'a TransferFunctionTables, interpreter: VolumeInterpreter) -> MarchParams<'a> {
        MarchParams {
            step_size: 0.3,
            max_steps: 1000,
            interpreter,
            sampler: Sampler::Regular,
            tables,
            interpreter_params: InterpreterParams {
                iso_value: 0.5,
                iso_color: Vector4::new(1.0, 1.0, 1.0, 1.0),
                termination_threshold: 2.0,
            },
        }
    }

    #[test]
    fn test_uniform_volume_composites_per_step() {
        let tf = TransferFunction::linear_ramp(0.0, 1.0).expect("valid ramp");
        let volumes = vec![active(0, 0.5, Matrix4::identity())];
        let rule = AggregationRule::Maximum;
        let field = Field::new(&volumes, &rule).expect("bounded");
        let ray = Ray::new(Vector3::new(0.5, 0.5, -1.0), Vector3::new(0.0, 0.0, 1.0));

        let result = march_ray(&field, &ray, &params(tf.tables(), VolumeInterpreter::Transparent));
        // Samples at depth 0, 0.3, 0.6 and 0.9 inside the unit cube.
        assert_eq!(result.samples, 4);
        let expected_alpha = 1.0 - 0.5f32.powi(4);
        assert!((result.accumulator.alpha - expected_alpha).abs() < 1e-4);
        assert!((result.accumulator.color.x - 0.5 * expected_alpha).abs() < 1e-4);
    }

    #[test]
    fn test_gaps_between_volumes_are_empty_space() {
        let tf = TransferFunction::linear_ramp(0.0, 1.0).expect("valid ramp");
        let volumes = vec![
            active(0, 1.0, Matrix4::identity()),
            active(1, 1.0, Matrix4::from_translation(Vector3::new(0.0, 0.0, 3.0))),
        ];
        let rule = AggregationRule::Maximum;
        let field = Field::new(&volumes, &rule).expect("bounded");
        assert_eq!(field.bounds().map(|b| b.max.z), Some(4.0));
        assert_eq!(field.sample(Vector3::new(0.5, 0.5, 2.0)), None);
        assert_eq!(field.sample(Vector3::new(0.5, 0.5, 3.5)), Some(1.0));

        let ray = Ray::new(Vector3::new(0.5, 0.5, -1.0), Vector3::new(0.0, 0.0, 1.0));
        let result = march_ray(&field, &ray, &params(tf.tables(), VolumeInterpreter::Transparent));
        // Four steps inside each cube, none in the gap.
        assert_eq!(result.samples, 8);
    }

    #[test]
    fn test_missing_rays_and_empty_fields() {
        let tf = TransferFunction::linear_ramp(0.0, 1.0).expect("valid ramp");
        let rule = AggregationRule::Maximum;
        let empty: Vec<ActiveVolume> = Vec::new();
        let field = Field::new(&empty, &rule).expect("empty field");
        let ray = Ray::new(Vector3::new(0.5, 0.5, -1.0), Vector3::new(0.0, 0.0, 1.0));
        let result = march_ray(&field, &ray, &params(tf.tables(), VolumeInterpreter::Transparent));
        assert_eq!(result.samples, 0);
        assert_eq!(result.accumulator, RayAccumulator::new());

        let volumes = vec![active(0, 1.0, Matrix4::identity())];
        let field = Field::new(&volumes, &rule).expect("bounded");
        let away = Ray::new(Vector3::new(0.5, 0.5, -1.0), Vector3::new(0.0, 0.0, -1.0));
        assert_eq!(march_ray(&field, &away, &params(tf.tables(), VolumeInterpreter::Transparent)).samples, 0);
    }

    #[test]
    fn test_gradient_of_ramp() {
        let volume = Volume::from_fn("ramp", [32, 32, 32], Matrix4::identity(), |p| 2.0 * p.x).expect("valid volume");
        let volumes = vec![ActiveVolume {
            id: VolumeId(0),
            revision: 1,
            volume: Arc::new(volume),
            weight: 1.0,
        }];
        let rule = AggregationRule::Maximum;
        let field = Field::new(&volumes, &rule).expect("bounded");
        let g = field.gradient(Vector3::new(0.5, 0.5, 0.5), 0.05);
        assert!((g.x - 2.0).abs() < 1e-3);
        assert!(g.y.abs() < 1e-4 && g.z.abs() < 1e-4);
    }

    #[test]
    fn test_rejects_too_many_volumes() {
        let volumes: Vec<ActiveVolume> = (0..=MAX_BOUND_VOLUMES as u32)
            .map(|i| active(i, 1.0, Matrix4::identity()))
            .collect();
        let rule = AggregationRule::Maximum;
        assert!(matches!(
            Field::new(&volumes, &rule),
            Err(VolumeRenderError::TooManyVolumes { .. })
        ));
    }
}
