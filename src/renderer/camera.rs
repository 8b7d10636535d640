// src/renderer/camera.rs
//! Camera and per-pixel ray generation

use crate::error::{Result, VolumeRenderError};
use crate::math::{transform_point, Ray};
use cgmath::{ortho, perspective, InnerSpace, Matrix4, Point3, Rad, SquareMatrix, Vector3};

/// Output image size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(VolumeRenderError::InvalidSettings {
                field: format!("viewport {}x{} must be non-empty", self.width, self.height),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective { fovy: Rad<f32>, znear: f32, zfar: f32 },
    /// `height` is the world-space extent of the view volume along the up axis
    Orthographic { height: f32, znear: f32, zfar: f32 },
}

impl Projection {
    pub fn matrix(&self, aspect: f32) -> Matrix4<f32> {
        match *self {
            Projection::Perspective { fovy, znear, zfar } => perspective(fovy, aspect, znear, zfar),
            Projection::Orthographic { height, znear, zfar } => {
                let half_h = height * 0.5;
                let half_w = half_h * aspect;
                ortho(-half_w, half_w, -half_h, half_h, znear, zfar)
            }
        }
    }
}

/// Look-at camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub eye: Vector3<f32>,
    pub target: Vector3<f32>,
    pub up: Vector3<f32>,
    pub projection: Projection,
}

impl Camera {
    /// Perspective camera with a 45° vertical field of view
    pub fn perspective(eye: Vector3<f32>, target: Vector3<f32>) -> Self {
        Self {
            eye,
            target,
            up: Vector3::unit_y(),
            projection: Projection::Perspective {
                fovy: Rad(std::f32::consts::PI / 4.0),
                znear: 0.1,
                zfar: 1000.0,
            },
        }
    }

    pub fn orthographic(eye: Vector3<f32>, target: Vector3<f32>, height: f32) -> Self {
        Self {
            eye,
            target,
            up: Vector3::unit_y(),
            projection: Projection::Orthographic {
                height,
                znear: 0.0,
                zfar: 1000.0,
            },
        }
    }

    /// Perspective camera orbiting `target` at `distance`, angles in radians
    pub fn orbit(distance: f32, pitch: f32, yaw: f32, target: Vector3<f32>) -> Self {
        let eye = Vector3::new(
            distance * yaw.sin() * pitch.cos(),
            distance * pitch.sin(),
            distance * yaw.cos() * pitch.cos(),
        ) + target;
        Self::perspective(eye, target)
    }

    pub fn with_up(mut self, up: Vector3<f32>) -> Self {
        self.up = up;
        self
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        Matrix4::look_at_rh(
            Point3::new(self.eye.x, self.eye.y, self.eye.z),
            Point3::new(self.target.x, self.target.y, self.target.z),
            self.up,
        )
    }

    pub fn view_projection(&self, aspect: f32) -> Matrix4<f32> {
        self.projection.matrix(aspect) * self.view_matrix()
    }

    /// Prepare per-pixel ray generation for a viewport
    pub fn ray_generator(&self, viewport: Viewport) -> Result<RayGenerator> {
        viewport.validate()?;
        let forward = self.target - self.eye;
        if forward.magnitude2() == 0.0 || forward.cross(self.up).magnitude2() == 0.0 {
            return Err(VolumeRenderError::InvalidSettings {
                field: "camera eye, target and up must span a view basis".into(),
            });
        }
        let inverse_view_projection = self
            .view_projection(viewport.aspect())
            .invert()
            .ok_or_else(|| VolumeRenderError::InvalidSettings {
                field: "camera projection is not invertible".into(),
            })?;
        Ok(RayGenerator {
            inverse_view_projection,
            viewport,
        })
    }
}

/// Unprojects pixel centers into world-space rays
#[derive(Debug, Clone, Copy)]
pub struct RayGenerator {
    inverse_view_projection: Matrix4<f32>,
    viewport: Viewport,
}

impl RayGenerator {
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn inverse_view_projection(&self) -> &Matrix4<f32> {
        &self.inverse_view_projection
    }

    /// Ray through the center of pixel `(x, y)`, row 0 at the top.
    ///
    /// The ray starts on the near plane and points towards the far plane.
    pub fn ray(&self, x: u32, y: u32) -> Ray {
        let ndc_x = (x as f32 + 0.5) / self.viewport.width as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y as f32 + 0.5) / self.viewport.height as f32 * 2.0;

        let near = transform_point(&self.inverse_view_projection, Vector3::new(ndc_x, ndc_y, -1.0));
        let far = transform_point(&self.inverse_view_projection, Vector3::new(ndc_x, ndc_y, 1.0));
        Ray::new(near, far - near)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_ray_points_at_target() {
        let camera = Camera::perspective(Vector3::new(0.0, 0.0, 5.0), Vector3::new(0.0, 0.0, 0.0));
        let rays = camera.ray_generator(Viewport::new(3, 3)).expect("valid camera");
        let ray = rays.ray(1, 1);
        assert!((ray.direction - Vector3::new(0.0, 0.0, -1.0)).magnitude() < 1e-4);
        assert!((ray.origin.z - 4.9).abs() < 1e-3);
    }

    #[test]
    fn test_orthographic_rays_are_parallel() {
        let camera = Camera::orthographic(Vector3::new(0.5, 0.5, -2.0), Vector3::new(0.5, 0.5, 0.0), 1.0);
        let rays = camera.ray_generator(Viewport::new(4, 4)).expect("valid camera");
        let a = rays.ray(0, 0);
        let b = rays.ray(3, 2);
        assert!((a.direction - b.direction).magnitude() < 1e-5);
        assert!((a.direction - Vector3::new(0.0, 0.0, 1.0)).magnitude() < 1e-5);
        // Row 0 is the top of the image.
        assert!(a.origin.y > b.origin.y);
    }

    #[test]
    fn test_orbit_places_eye_at_distance() {
        let camera = Camera::orbit(4.0, 0.3, 1.1, Vector3::new(1.0, 0.0, 0.0));
        assert!(((camera.eye - camera.target).magnitude() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_degenerate_inputs() {
        let camera = Camera::perspective(Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.0));
        assert!(camera.ray_generator(Viewport::new(4, 4)).is_err());

        let camera = Camera::perspective(Vector3::new(0.0, 0.0, 1.0), Vector3::new(0.0, 0.0, 0.0));
        assert!(camera.ray_generator(Viewport::new(0, 4)).is_err());

        let looking_up = Camera::perspective(Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0));
        assert!(looking_up.ray_generator(Viewport::new(4, 4)).is_err());
    }
}
