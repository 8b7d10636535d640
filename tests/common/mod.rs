//! Shared fixtures for the integration tests
#![allow(dead_code)]

use cgmath::{Matrix4, SquareMatrix, Vector3};
use volren::prelude::*;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 2x2x2 volume with one value everywhere
pub fn uniform_volume(value: f32, transform: Matrix4<f32>) -> Volume {
    Volume::scalar("uniform", [2, 2, 2], vec![value; 8], transform).expect("valid volume")
}

pub fn unit_uniform(value: f32) -> Volume {
    uniform_volume(value, Matrix4::identity())
}

/// Orthographic camera looking down +z at the center of the unit cube.
/// Every ray enters the cube at z = 0 one unit from its origin.
pub fn front_camera(height: f32) -> Camera {
    Camera::orthographic(Vector3::new(0.5, 0.5, -1.0), Vector3::new(0.5, 0.5, 0.5), height)
}

pub fn cpu_renderer(settings: RenderSettings) -> MultiVolumeRenderer<CpuBackend> {
    MultiVolumeRenderer::new(CpuBackend::new(), settings).expect("valid settings")
}

pub fn assert_pixels_close(a: &FrameBuffer, b: &FrameBuffer, tolerance: f32) {
    assert_eq!((a.width(), a.height()), (b.width(), b.height()));
    for (i, (pa, pb)) in a.pixels().iter().zip(b.pixels()).enumerate() {
        for c in 0..4 {
            assert!(
                (pa[c] - pb[c]).abs() <= tolerance,
                "pixel {} channel {}: {} vs {}",
                i,
                c,
                pa[c],
                pb[c]
            );
        }
    }
}
