//! Cube geometry and the model/view/projection transform.

use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Pixel dimensions of a surface or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Clamp both dimensions to at least one pixel.
    pub fn at_least_one(self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect_ratio(&self) -> f32 {
        let e = self.at_least_one();
        e.width as f32 / e.height as f32
    }
}

/// Vertex layout shared by the cube shaders (location 0 = position, 1 = colour).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

const fn vertex(position: [f32; 3], color: [f32; 3]) -> Vertex {
    Vertex { position, color }
}

pub const CUBE_VERTICES: [Vertex; 8] = [
    vertex([-1.0, -1.0, -1.0], [0.0, 0.0, 0.0]),
    vertex([-1.0, 1.0, -1.0], [0.0, 1.0, 0.0]),
    vertex([1.0, 1.0, -1.0], [1.0, 1.0, 0.0]),
    vertex([1.0, -1.0, -1.0], [1.0, 0.0, 0.0]),
    vertex([-1.0, -1.0, 1.0], [0.0, 0.0, 1.0]),
    vertex([-1.0, 1.0, 1.0], [0.0, 1.0, 1.0]),
    vertex([1.0, 1.0, 1.0], [1.0, 1.0, 1.0]),
    vertex([1.0, -1.0, 1.0], [1.0, 0.0, 1.0]),
];

pub const CUBE_INDICES: [u16; 36] = [
    0, 1, 2, 0, 2, 3,
    4, 6, 5, 4, 7, 6,
    4, 5, 1, 4, 1, 0,
    3, 2, 6, 3, 6, 7,
    1, 5, 6, 1, 6, 2,
    4, 0, 3, 4, 3, 7,
];

/// Rotation speed of the cube.
pub const DEGREES_PER_SECOND: f32 = 90.0;
/// Vertical field of view.
pub const FOV_Y_DEGREES: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 100.0;

/// Model matrix after `elapsed` of wall-clock time.
pub fn model_matrix(elapsed: Duration) -> Mat4 {
    let angle = (elapsed.as_secs_f64() * DEGREES_PER_SECOND as f64) as f32;
    let axis = Vec3::new(0.0, 1.0, 1.0).normalize();
    Mat4::from_axis_angle(axis, angle.to_radians())
}

pub fn view_matrix() -> Mat4 {
    Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y)
}

/// Perspective projection with a [0, 1] depth range and Vulkan's downward Y.
pub fn projection_matrix(extent: Extent2D) -> Mat4 {
    let mut proj = Mat4::perspective_rh(
        FOV_Y_DEGREES.to_radians(),
        extent.aspect_ratio(),
        Z_NEAR,
        Z_FAR,
    );
    proj.y_axis.y *= -1.0;
    proj
}

/// `projection × view × model`.
pub fn mvp(elapsed: Duration, extent: Extent2D) -> Mat4 {
    projection_matrix(extent) * view_matrix() * model_matrix(elapsed)
}

/// Wall-clock source for the animation.
#[derive(Debug, Clone, Copy)]
pub struct SceneClock {
    start: Instant,
}

impl SceneClock {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for SceneClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&CUBE_VERTICES).len(), 8 * 24);
    }

    #[test]
    fn test_indices_reference_existing_vertices() {
        assert!(CUBE_INDICES.iter().all(|&i| (i as usize) < CUBE_VERTICES.len()));
        assert_eq!(CUBE_INDICES.len() % 3, 0);
    }

    #[test]
    fn test_extent_clamp() {
        assert_eq!(Extent2D::new(0, 0).at_least_one(), Extent2D::new(1, 1));
        assert_eq!(Extent2D::new(0, 600).at_least_one(), Extent2D::new(1, 600));
        assert!(Extent2D::new(0, 600).is_empty());
        assert!(!Extent2D::new(800, 600).is_empty());
    }

    #[test]
    fn test_aspect_ratio_never_divides_by_zero() {
        assert_eq!(Extent2D::new(10, 0).aspect_ratio(), 10.0);
        assert!((Extent2D::new(800, 600).aspect_ratio() - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_model_is_identity_at_start() {
        let m = model_matrix(Duration::ZERO);
        assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn test_rotation_depends_on_time_not_frames() {
        // Half a revolution after two seconds.
        let m = model_matrix(Duration::from_secs(2));
        let axis = Vec3::new(0.0, 1.0, 1.0).normalize();
        let expected = Mat4::from_axis_angle(axis, std::f32::consts::PI);
        assert!(m.abs_diff_eq(expected, 1e-5));
        // The axis itself is left in place.
        assert!(m.transform_vector3(axis).abs_diff_eq(axis, 1e-5));
    }

    #[test]
    fn test_mvp_composition_order() {
        let elapsed = Duration::from_millis(750);
        let extent = Extent2D::new(800, 600);
        let expected = projection_matrix(extent) * view_matrix() * model_matrix(elapsed);
        assert!(mvp(elapsed, extent).abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn test_origin_projects_inside_depth_range() {
        let clip = mvp(Duration::ZERO, Extent2D::new(800, 600)) * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc_z = clip.z / clip.w;
        assert!(ndc_z > 0.0 && ndc_z < 1.0);
        assert!((clip.x / clip.w).abs() < 1e-5);
    }
}
