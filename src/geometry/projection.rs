//! Mesh silhouettes and pose-axes overlays in image space.

use nalgebra::{Vector2, Vector3};
use opencv::core::{CV_8UC1, Mat, Scalar};
use opencv::prelude::*;

use crate::geometry::{SE3, TriangleMesh};
use crate::tracking::frame::CameraModel;

/// Value written into set mask pixels.
pub const MASK_ON: u8 = 255;

/// Length of the drawn pose axes, in metres.
pub const AXIS_LENGTH: f64 = 1.0 / 6.0;

/// Single-channel binary mask, row-major, same size as the camera image.
#[derive(Debug, Clone, PartialEq)]
pub struct SilhouetteMask {
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl SilhouetteMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    pub fn set(&mut self, x: u32, y: u32) {
        if x < self.width && y < self.height {
            self.pixels[y as usize * self.width as usize + x as usize] = MASK_ON;
        }
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        x < self.width
            && y < self.height
            && self.pixels[y as usize * self.width as usize + x as usize] != 0
    }

    /// Number of set pixels.
    pub fn count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p != 0).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy into an 8-bit OpenCV mask for feature detection.
    pub fn to_mat(&self) -> opencv::Result<Mat> {
        let mut mat = Mat::new_rows_cols_with_default(
            self.height as i32,
            self.width as i32,
            CV_8UC1,
            Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(&self.pixels);
        Ok(mat)
    }
}

/// Rasterize `mesh` under `pose` into a silhouette mask.
///
/// A pixel is set when its centre lies inside a projected triangle, or
/// when one of the triangle's edges passes through it. Work per triangle
/// is bounded by the image size, however large its projection.
/// Triangles with a vertex at or behind the camera plane are skipped.
pub fn mesh_pose_to_mask(mesh: &TriangleMesh, pose: &SE3, camera: &CameraModel) -> SilhouetteMask {
    let mut mask = SilhouetteMask::new(camera.width, camera.height);

    let projected: Vec<Option<Vector2<f64>>> = mesh
        .vertices
        .iter()
        .map(|v| camera.project(&pose.transform_point(v)))
        .collect();

    for tri in &mesh.triangles {
        let corners = tri.map(|i| projected.get(i as usize).copied().flatten());
        let [Some(p0), Some(p1), Some(p2)] = corners else {
            continue;
        };
        fill_triangle(&mut mask, [p0, p1, p2]);
    }

    mask
}

/// Barycentric tolerance for pixel centres on a shared edge.
const INSIDE_EPS: f64 = 1e-9;

fn cross(a: Vector2<f64>, b: Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

fn fill_triangle(mask: &mut SilhouetteMask, [p0, p1, p2]: [Vector2<f64>; 3]) {
    // Edges first: thin or degenerate triangles still mark the pixels they cross.
    for (a, b) in [(p0, p1), (p1, p2), (p2, p0)] {
        draw_segment(mask, a, b);
    }

    let area = cross(p1 - p0, p2 - p0);
    if !area.is_finite() || area.abs() < f64::EPSILON {
        return;
    }

    let (w, h) = (f64::from(mask.width), f64::from(mask.height));
    let x0 = p0.x.min(p1.x).min(p2.x).floor().clamp(0.0, w);
    let x1 = p0.x.max(p1.x).max(p2.x).ceil().clamp(0.0, w);
    let y0 = p0.y.min(p1.y).min(p2.y).floor().clamp(0.0, h);
    let y1 = p0.y.max(p1.y).max(p2.y).ceil().clamp(0.0, h);

    for y in (y0 as u32)..(y1 as u32) {
        for x in (x0 as u32)..(x1 as u32) {
            let c = Vector2::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
            let w0 = cross(p1 - c, p2 - c) / area;
            let w1 = cross(p2 - c, p0 - c) / area;
            let w2 = cross(p0 - c, p1 - c) / area;
            if w0 >= -INSIDE_EPS && w1 >= -INSIDE_EPS && w2 >= -INSIDE_EPS {
                mask.set(x, y);
            }
        }
    }
}

/// Mark every pixel the segment `a`-`b` passes through, clipped to the mask.
fn draw_segment(mask: &mut SilhouetteMask, a: Vector2<f64>, b: Vector2<f64>) {
    let Some((a, b)) = clip_segment(a, b, f64::from(mask.width), f64::from(mask.height)) else {
        return;
    };
    let d = b - a;
    let n = edge_steps(d.norm());
    for k in 0..=n {
        let p = a + d * (k as f64 / n as f64);
        if p.x >= 0.0 && p.y >= 0.0 {
            mask.set(p.x.floor() as u32, p.y.floor() as u32);
        }
    }
}

/// Liang-Barsky clip of `a`-`b` against `[0, w] x [0, h]`.
fn clip_segment(
    a: Vector2<f64>,
    b: Vector2<f64>,
    w: f64,
    h: f64,
) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let d = b - a;
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in [(-d.x, a.x), (d.x, w - a.x), (-d.y, a.y), (d.y, h - a.y)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            t0 = t0.max(t);
        } else {
            t1 = t1.min(t);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some((a + d * t0, a + d * t1))
}

/// Step count for an edge so that each step covers at most one pixel.
fn edge_steps(len: f64) -> usize {
    if len.is_finite() && len > 1.0 {
        len.ceil() as usize
    } else {
        1
    }
}

/// Projected origin and X/Y/Z axis tips of an object pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxesOverlay {
    pub origin: Vector2<f64>,
    pub x: Vector2<f64>,
    pub y: Vector2<f64>,
    pub z: Vector2<f64>,
}

/// Project the object's coordinate axes into the image.
///
/// Returns `None` if the origin or any tip is not in front of the camera.
pub fn project_axes(pose: &SE3, camera: &CameraModel) -> Option<AxesOverlay> {
    let tip = |axis: Vector3<f64>| camera.project(&pose.transform_point(&(axis * AXIS_LENGTH)));
    Some(AxesOverlay {
        origin: camera.project(&pose.translation)?,
        x: tip(Vector3::x())?,
        y: tip(Vector3::y())?,
        z: tip(Vector3::z())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use std::time::{Duration, Instant};

    /// Unit focal length, principal point at the origin: a point at z = 1
    /// projects to its own (x, y).
    fn unit_camera() -> CameraModel {
        CameraModel::from_pinhole(1.0, 1.0, 0.0, 0.0, 32, 32)
    }

    fn single_triangle() -> TriangleMesh {
        TriangleMesh::new(
            vec![
                Vector3::new(0.0, 0.0, 1.0),
                Vector3::new(10.0, 0.0, 1.0),
                Vector3::new(0.0, 10.0, 1.0),
            ],
            vec![[0, 1, 2]],
        )
    }

    #[test]
    fn test_triangle_coverage() {
        let mask = mesh_pose_to_mask(&single_triangle(), &SE3::identity(), &unit_camera());

        assert!(mask.is_set(0, 0));
        assert!(mask.is_set(5, 4));
        assert!(mask.is_set(9, 0));
        assert!(mask.is_set(0, 9));
        for y in 0..32 {
            for x in 0..32 {
                if x + y > 11 {
                    assert!(!mask.is_set(x, y), "pixel ({x}, {y}) outside the triangle");
                }
            }
        }
    }

    #[test]
    fn test_triangle_behind_camera_skipped() {
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, -2.0),
        };
        let mask = mesh_pose_to_mask(&single_triangle(), &pose, &unit_camera());
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn test_out_of_image_part_clipped() {
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(28.0, 28.0, 0.0),
        };
        let mask = mesh_pose_to_mask(&single_triangle(), &pose, &unit_camera());

        assert!(mask.is_set(28, 28));
        assert!(mask.is_set(31, 28));
        assert!(mask.count() > 0);
        assert!(mask.count() < 32 * 32);
    }

    #[test]
    fn test_degenerate_triangle_marks_vertex() {
        let mesh = TriangleMesh::new(vec![Vector3::new(3.5, 4.5, 1.0)], vec![[0, 0, 0]]);
        let mask = mesh_pose_to_mask(&mesh, &SE3::identity(), &unit_camera());

        assert!(mask.is_set(3, 4));
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn test_near_plane_triangle_bounded_by_image() {
        let camera = CameraModel::from_pinhole(525.0, 525.0, 319.5, 239.5, 640, 480);
        for z in [5e-4, 2e-6] {
            let mesh = TriangleMesh::new(
                vec![
                    Vector3::new(0.0, 0.0, 0.6),
                    Vector3::new(0.05, 0.0, z),
                    Vector3::new(0.0, 0.05, z),
                ],
                vec![[0, 1, 2]],
            );

            let start = Instant::now();
            let mask = mesh_pose_to_mask(&mesh, &SE3::identity(), &camera);
            assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());

            // The projection covers the lower-right quadrant from the principal point.
            assert!(mask.is_set(320, 240));
            assert!(mask.is_set(639, 479));
            assert!(mask.is_set(639, 240));
            assert!(!mask.is_set(100, 100));
            assert!(!mask.is_set(300, 400));
            let count = mask.count();
            assert!((320 * 240..=322 * 242).contains(&count), "count {count}");
        }
    }

    #[test]
    fn test_triangle_outside_image_leaves_mask_empty() {
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(100.0, -50.0, 0.0),
        };
        let mask = mesh_pose_to_mask(&single_triangle(), &pose, &unit_camera());
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn test_axes_projection() {
        let camera = CameraModel::from_pinhole(600.0, 600.0, 320.0, 240.0, 640, 480);
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 1.0),
        };

        let axes = project_axes(&pose, &camera).unwrap();
        assert_relative_eq!(axes.origin, Vector2::new(320.0, 240.0), epsilon = 1e-9);
        assert_relative_eq!(axes.x, Vector2::new(420.0, 240.0), epsilon = 1e-9);
        assert_relative_eq!(axes.y, Vector2::new(320.0, 340.0), epsilon = 1e-9);
        // Z axis points away from the camera, so its tip stays near the centre.
        assert_relative_eq!(axes.z, Vector2::new(320.0, 240.0), epsilon = 1e-9);
    }
}
