// src/volume/mod.rs
//! # Volumes
//!
//! A [`Volume`] is an immutable 3D scalar or vector field. Voxel data lives in
//! unit voxel space `[0,1]^3` with samples at voxel centers; the volume's
//! transform places that cube in world space. Vector fields are sampled by
//! magnitude.
//!
//! Volumes are owned by the [`VolumeDataManager`] and handed to the renderer
//! as `Arc<Volume>` for the duration of a frame.

pub mod data_manager;

pub use data_manager::{ListenerId, VolumeDataEvent, VolumeDataManager};

use crate::error::{Result, VolumeRenderError};
use crate::math::{transform_point, Aabb};
use cgmath::{Matrix4, SquareMatrix, Vector3};
use std::fmt;

/// Voxel-space tolerance for the inside test of [`Volume::sample_world`]
pub const BOUNDARY_EPSILON: f32 = 1e-4;

/// Identifier of a loaded volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub u32);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume#{}", self.0)
    }
}

/// Raw voxel payload, x fastest then y then z
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeData {
    Scalar(Vec<f32>),
    Vector(Vec<[f32; 3]>),
}

impl VolumeData {
    fn len(&self) -> usize {
        match self {
            VolumeData::Scalar(v) => v.len(),
            VolumeData::Vector(v) => v.len(),
        }
    }

    /// Components per voxel
    pub fn components(&self) -> usize {
        match self {
            VolumeData::Scalar(_) => 1,
            VolumeData::Vector(_) => 3,
        }
    }
}

/// Immutable 3D field with a world transform and a value range
#[derive(Debug, Clone)]
pub struct Volume {
    label: String,
    dimensions: [u32; 3],
    data: VolumeData,
    scalars: Vec<f32>,
    transform: Matrix4<f32>,
    inverse: Matrix4<f32>,
    value_range: (f32, f32),
}

impl Volume {
    /// Create a volume from a validated payload
    pub fn new(
        label: impl Into<String>,
        dimensions: [u32; 3],
        data: VolumeData,
        transform: Matrix4<f32>,
    ) -> Result<Self> {
        let label = label.into();
        if dimensions.iter().any(|&d| d == 0) {
            return Err(VolumeRenderError::volume(format!(
                "{}: dimensions must be non-zero, got {:?}",
                label, dimensions
            )));
        }

        let expected = dimensions
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
            .ok_or_else(|| VolumeRenderError::volume(format!("{}: dimensions overflow", label)))?;
        if data.len() != expected {
            return Err(VolumeRenderError::volume(format!(
                "{}: expected {} voxels, got {}",
                label,
                expected,
                data.len()
            )));
        }

        let scalars: Vec<f32> = match &data {
            VolumeData::Scalar(values) => values.clone(),
            VolumeData::Vector(values) => values
                .iter()
                .map(|v| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt())
                .collect(),
        };
        if scalars.iter().any(|v| !v.is_finite()) {
            return Err(VolumeRenderError::volume(format!(
                "{}: voxel data contains non-finite values",
                label
            )));
        }

        let inverse = transform.invert().ok_or_else(|| {
            VolumeRenderError::volume(format!("{}: transform is not invertible", label))
        })?;

        let value_range = scalars
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });

        Ok(Self {
            label,
            dimensions,
            data,
            scalars,
            transform,
            inverse,
            value_range,
        })
    }

    /// Scalar volume convenience constructor
    pub fn scalar(
        label: impl Into<String>,
        dimensions: [u32; 3],
        values: Vec<f32>,
        transform: Matrix4<f32>,
    ) -> Result<Self> {
        Self::new(label, dimensions, VolumeData::Scalar(values), transform)
    }

    /// Build a scalar volume by evaluating `f` at every voxel center.
    ///
    /// `f` receives voxel-space coordinates in `[0,1]^3`.
    pub fn from_fn<F>(
        label: impl Into<String>,
        dimensions: [u32; 3],
        transform: Matrix4<f32>,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(Vector3<f32>) -> f32,
    {
        let [nx, ny, nz] = dimensions;
        let mut values = Vec::with_capacity(nx as usize * ny as usize * nz as usize);
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    values.push(f(Vector3::new(
                        (x as f32 + 0.5) / nx as f32,
                        (y as f32 + 0.5) / ny as f32,
                        (z as f32 + 0.5) / nz as f32,
                    )));
                }
            }
        }
        Self::scalar(label, dimensions, values, transform)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dimensions(&self) -> [u32; 3] {
        self.dimensions
    }

    pub fn data(&self) -> &VolumeData {
        &self.data
    }

    /// Per-voxel scalar values (magnitudes for vector volumes)
    pub fn scalars(&self) -> &[f32] {
        &self.scalars
    }

    /// `[min, max]` over all voxels
    pub fn value_range(&self) -> (f32, f32) {
        self.value_range
    }

    /// Voxel space to world space
    pub fn transform(&self) -> &Matrix4<f32> {
        &self.transform
    }

    /// World space to voxel space
    pub fn inverse_transform(&self) -> &Matrix4<f32> {
        &self.inverse
    }

    /// World-space bounding box
    pub fn world_bounds(&self) -> Aabb {
        Aabb::unit().transform(&self.transform)
    }

    /// Scalar value of one voxel, clamped to the grid
    pub fn voxel(&self, x: i64, y: i64, z: i64) -> f32 {
        let [nx, ny, nz] = self.dimensions;
        let x = x.clamp(0, nx as i64 - 1) as usize;
        let y = y.clamp(0, ny as i64 - 1) as usize;
        let z = z.clamp(0, nz as i64 - 1) as usize;
        self.scalars[(z * ny as usize + y) * nx as usize + x]
    }

    /// Trilinear sample at voxel-space coordinates, clamped to the edge voxels
    pub fn sample_local(&self, p: Vector3<f32>) -> f32 {
        let [nx, ny, nz] = self.dimensions;
        let gx = p.x * nx as f32 - 0.5;
        let gy = p.y * ny as f32 - 0.5;
        let gz = p.z * nz as f32 - 0.5;

        let x0 = gx.floor();
        let y0 = gy.floor();
        let z0 = gz.floor();
        let (tx, ty, tz) = (gx - x0, gy - y0, gz - z0);
        let (x0, y0, z0) = (x0 as i64, y0 as i64, z0 as i64);

        let c = |dx: i64, dy: i64, dz: i64| self.voxel(x0 + dx, y0 + dy, z0 + dz);
        let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;

        let c00 = lerp(c(0, 0, 0), c(1, 0, 0), tx);
        let c10 = lerp(c(0, 1, 0), c(1, 1, 0), tx);
        let c01 = lerp(c(0, 0, 1), c(1, 0, 1), tx);
        let c11 = lerp(c(0, 1, 1), c(1, 1, 1), tx);
        lerp(lerp(c00, c10, ty), lerp(c01, c11, ty), tz)
    }

    /// Trilinear sample at a world position; `None` outside the volume.
    ///
    /// Positions within [`BOUNDARY_EPSILON`] of a face count as inside, so
    /// rays that enter exactly on a face are not lost to rounding.
    pub fn sample_world(&self, p: Vector3<f32>) -> Option<f32> {
        let local = transform_point(&self.inverse, p);
        let lo = -BOUNDARY_EPSILON;
        let hi = 1.0 + BOUNDARY_EPSILON;
        let inside = (lo..=hi).contains(&local.x) && (lo..=hi).contains(&local.y) && (lo..=hi).contains(&local.z);
        inside.then(|| self.sample_local(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_x(dimensions: [u32; 3]) -> Volume {
        Volume::from_fn("ramp", dimensions, Matrix4::identity(), |p| p.x).expect("valid volume")
    }

    #[test]
    fn test_rejects_bad_payloads() {
        assert!(Volume::scalar("empty", [0, 1, 1], vec![], Matrix4::identity()).is_err());
        assert!(Volume::scalar("short", [2, 2, 2], vec![0.0; 7], Matrix4::identity()).is_err());
        assert!(Volume::scalar("nan", [1, 1, 1], vec![f32::NAN], Matrix4::identity()).is_err());
        assert!(Volume::scalar("flat", [1, 1, 1], vec![1.0], Matrix4::from_scale(0.0)).is_err());
    }

    #[test]
    fn test_value_range_and_vector_magnitude() {
        let volume = Volume::new(
            "vectors",
            [2, 1, 1],
            VolumeData::Vector(vec![[3.0, 4.0, 0.0], [0.0, 0.0, -1.0]]),
            Matrix4::identity(),
        )
        .expect("valid volume");
        assert_eq!(volume.value_range(), (1.0, 5.0));
        assert_eq!(volume.data().components(), 3);
        assert_eq!(volume.scalars(), &[5.0, 1.0]);
    }

    #[test]
    fn test_trilinear_sampling_of_ramp() {
        let volume = ramp_x([16, 4, 4]);
        for &x in &[0.2f32, 0.5, 0.77] {
            let v = volume.sample_local(Vector3::new(x, 0.5, 0.5));
            assert!((v - x).abs() < 1e-5, "sample at {} was {}", x, v);
        }
        // Clamped at the edges.
        let edge = volume.sample_local(Vector3::new(0.0, 0.5, 0.5));
        assert!((edge - 0.5 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_world_sampling_respects_transform() {
        let transform = Matrix4::from_translation(Vector3::new(10.0, 0.0, 0.0)) * Matrix4::from_scale(2.0);
        let volume = Volume::from_fn("moved", [8, 8, 8], transform, |p| p.x).expect("valid volume");

        assert!(volume.sample_world(Vector3::new(0.0, 0.0, 0.0)).is_none());
        let v = volume.sample_world(Vector3::new(11.0, 1.0, 1.0)).expect("inside");
        assert!((v - 0.5).abs() < 1e-5);

        let bounds = volume.world_bounds();
        assert_eq!(bounds.min, Vector3::new(10.0, 0.0, 0.0));
        assert_eq!(bounds.max, Vector3::new(12.0, 2.0, 2.0));
    }
}
