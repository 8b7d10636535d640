// src/math.rs
//! Geometry helpers for ray marching
//!
//! Rays and axis-aligned boxes used to clip camera rays against the combined
//! bounds of the loaded volumes.

use cgmath::{ElementWise, InnerSpace, Matrix4, Vector3, Vector4, Zero};

/// Straight-alpha RGBA color, each channel in `[0, 1]`
pub type Rgba = Vector4<f32>;

/// Clamp every channel into `[0, 1]`, mapping NaN to zero
pub fn saturate(color: Rgba) -> Rgba {
    let clamp = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    Vector4::new(clamp(color.x), clamp(color.y), clamp(color.z), clamp(color.w))
}

/// Linear interpolation between two colors
pub fn lerp_rgba(a: Rgba, b: Rgba, t: f32) -> Rgba {
    a + (b - a) * t
}

/// A 3D ray for intersection testing
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    /// Ray origin point in world space
    pub origin: Vector3<f32>,
    /// Ray direction (normalized)
    pub direction: Vector3<f32>,
}

impl Ray {
    /// Create a new ray, normalizing the direction
    pub fn new(origin: Vector3<f32>, direction: Vector3<f32>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Get a point along the ray at distance t
    pub fn point_at(&self, t: f32) -> Vector3<f32> {
        self.origin + self.direction * t
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
}

impl Aabb {
    pub fn new(min: Vector3<f32>, max: Vector3<f32>) -> Self {
        Self { min, max }
    }

    /// Unit cube `[0,1]^3`, the voxel-space extent of every volume
    pub fn unit() -> Self {
        Self::new(Vector3::zero(), Vector3::new(1.0, 1.0, 1.0))
    }

    /// Create an AABB enclosing a set of points
    pub fn from_points(points: &[Vector3<f32>]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut min = *first;
        let mut max = *first;

        for p in rest {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Some(Self::new(min, max))
    }

    /// Smallest box containing both boxes
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(
            Vector3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            Vector3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        )
    }

    pub fn contains(&self, p: Vector3<f32>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Slab test returning the parametric entry/exit distances along the ray.
    ///
    /// The entry distance is clamped to zero when the origin is inside the box.
    pub fn intersect_ray(&self, ray: &Ray) -> Option<(f32, f32)> {
        let inv_dir = Vector3::new(
            1.0 / ray.direction.x,
            1.0 / ray.direction.y,
            1.0 / ray.direction.z,
        );

        let t_min = (self.min - ray.origin).mul_element_wise(inv_dir);
        let t_max = (self.max - ray.origin).mul_element_wise(inv_dir);

        // Axis-parallel rays produce NaN for 0 * inf; f32::min/max ignore NaN.
        let t1 = Vector3::new(
            t_min.x.min(t_max.x),
            t_min.y.min(t_max.y),
            t_min.z.min(t_max.z),
        );
        let t2 = Vector3::new(
            t_min.x.max(t_max.x),
            t_min.y.max(t_max.y),
            t_min.z.max(t_max.z),
        );

        let t_near = t1.x.max(t1.y.max(t1.z));
        let t_far = t2.x.min(t2.y.min(t2.z));

        if t_near <= t_far && t_far >= 0.0 {
            Some((t_near.max(0.0), t_far))
        } else {
            None
        }
    }

    /// Apply a transformation matrix to the AABB
    pub fn transform(&self, matrix: &Matrix4<f32>) -> Self {
        let corners = [
            Vector3::new(self.min.x, self.min.y, self.min.z),
            Vector3::new(self.max.x, self.min.y, self.min.z),
            Vector3::new(self.min.x, self.max.y, self.min.z),
            Vector3::new(self.min.x, self.min.y, self.max.z),
            Vector3::new(self.max.x, self.max.y, self.min.z),
            Vector3::new(self.max.x, self.min.y, self.max.z),
            Vector3::new(self.min.x, self.max.y, self.max.z),
            Vector3::new(self.max.x, self.max.y, self.max.z),
        ];

        let transformed: Vec<Vector3<f32>> = corners
            .iter()
            .map(|c| transform_point(matrix, *c))
            .collect();

        // Eight corners are always present.
        Self::from_points(&transformed).unwrap_or(*self)
    }
}

/// Transform a point by a homogeneous matrix
pub fn transform_point(matrix: &Matrix4<f32>, p: Vector3<f32>) -> Vector3<f32> {
    let h = matrix * Vector4::new(p.x, p.y, p.z, 1.0);
    Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w)
}
