use nalgebra::{Matrix3, Vector2, Vector3};

/// Pinhole camera intrinsics plus image size.
///
/// Fixed once per session from the first camera-info message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    k: Matrix3<f64>,
    k_inv: Matrix3<f64>,
    pub width: u32,
    pub height: u32,
}

/// Points closer to the image plane than this are treated as not projectable.
const MIN_PROJECTION_DEPTH: f64 = 1e-6;

impl CameraModel {
    /// Build from a row-major 3x3 intrinsic matrix, as delivered by camera info.
    ///
    /// Returns `None` when the matrix is not invertible.
    pub fn from_row_major(k: [f64; 9], width: u32, height: u32) -> Option<Self> {
        let k = Matrix3::from_row_slice(&k);
        let k_inv = k.try_inverse()?;
        Some(Self {
            k,
            k_inv,
            width,
            height,
        })
    }

    pub fn from_pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
        let k_inv = Matrix3::new(
            1.0 / fx,
            0.0,
            -cx / fx,
            0.0,
            1.0 / fy,
            -cy / fy,
            0.0,
            0.0,
            1.0,
        );
        Self {
            k,
            k_inv,
            width,
            height,
        }
    }

    pub fn k(&self) -> &Matrix3<f64> {
        &self.k
    }

    pub fn fx(&self) -> f64 {
        self.k[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.k[(1, 1)]
    }

    pub fn cx(&self) -> f64 {
        self.k[(0, 2)]
    }

    pub fn cy(&self) -> f64 {
        self.k[(1, 2)]
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        let h = self.k * p_cam;
        if h.z <= MIN_PROJECTION_DEPTH {
            return None;
        }
        Some(Vector2::new(h.x / h.z, h.y / h.z))
    }

    /// Lift a pixel with known depth back to a camera-frame point.
    pub fn backproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        depth * (self.k_inv * Vector3::new(u, v, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_backproject() {
        let cam = CameraModel::from_pinhole(525.0, 525.0, 319.5, 239.5, 640, 480);
        let p = Vector3::new(0.1, -0.05, 0.8);

        let uv = cam.project(&p).unwrap();
        let back = cam.backproject(uv.x, uv.y, p.z);
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_row_major_matches_pinhole() {
        let a = CameraModel::from_row_major(
            [525.0, 0.0, 319.5, 0.0, 520.0, 239.5, 0.0, 0.0, 1.0],
            640,
            480,
        )
        .unwrap();
        let b = CameraModel::from_pinhole(525.0, 520.0, 319.5, 239.5, 640, 480);

        assert_relative_eq!(a.fx(), b.fx());
        assert_relative_eq!(a.fy(), b.fy());
        assert_relative_eq!(a.cx(), b.cx());
        assert_relative_eq!(a.cy(), b.cy());
        assert_relative_eq!(a.backproject(10.0, 20.0, 2.0), b.backproject(10.0, 20.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_singular_matrix_rejected() {
        assert!(CameraModel::from_row_major([0.0; 9], 640, 480).is_none());
    }

    #[test]
    fn test_points_behind_camera_not_projected() {
        let cam = CameraModel::from_pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project(&Vector3::new(0.0, 0.0, 0.0)).is_none());
    }
}
