//! Preview rendering boundary.
//!
//! A renderer turns a mesh plus a ring of cameras into RGB images. None ships
//! with the crate; callers plug one in with
//! [`GenerationPipeline::with_renderer`](crate::pipeline::GenerationPipeline::with_renderer).
//! Previews are best effort: the pipeline swallows every renderer failure.

use glam::Vec3;
use image::RgbImage;

use crate::mesh::TriMesh;
use crate::Result;

/// Horizontal and vertical field of view of the pan cameras, in radians.
pub const PAN_FOV: f32 = 0.7;

/// Distance of the pan cameras from the origin.
pub const PAN_DISTANCE: f32 = 4.0;

/// A pinhole camera: position, orthonormal basis, image size and field of view.
///
/// `z` is the viewing direction; `x` and `y` span the image plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub origin: Vec3,
    pub x: Vec3,
    pub y: Vec3,
    pub z: Vec3,
    pub width: u32,
    pub height: u32,
    pub x_fov: f32,
    pub y_fov: f32,
}

/// `count` cameras circling the origin, looking slightly down at it.
///
/// Angles are spaced evenly over `[0, 2π]` with both ends included, so the
/// first and last poses coincide for `count > 1`.
pub fn create_pan_cameras(count: usize, size: u32) -> Vec<CameraPose> {
    let step = if count > 1 {
        std::f32::consts::TAU / (count - 1) as f32
    } else {
        0.0
    };

    (0..count)
        .map(|i| {
            let theta = i as f32 * step;
            let (sin, cos) = theta.sin_cos();
            let z = Vec3::new(sin, cos, -0.5).normalize();
            let x = Vec3::new(cos, -sin, 0.0);
            let y = z.cross(x);
            CameraPose {
                origin: -z * PAN_DISTANCE,
                x,
                y,
                z,
                width: size,
                height: size,
                x_fov: PAN_FOV,
                y_fov: PAN_FOV,
            }
        })
        .collect()
}

/// Renders preview images of a mesh.
pub trait Renderer: Send + Sync {
    /// One image per camera, in camera order.
    fn render(&self, mesh: &TriMesh, cameras: &[CameraPose]) -> Result<Vec<RgbImage>>;
}
