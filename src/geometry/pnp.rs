//! PnP (Perspective-n-Point) solver using OpenCV.

use nalgebra::{Matrix3, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Point3d, Vector};
use opencv::prelude::*;
use serde::Deserialize;

use crate::error::{Result, TrackingError};
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Minimum number of correspondences accepted by the solver.
pub const MIN_PNP_CORRESPONDENCES: usize = 4;

/// RANSAC parameters for PnP.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PnpConfig {
    pub iterations: i32,
    /// RANSAC inlier threshold, in pixels.
    pub reprojection_threshold: f32,
    pub confidence: f64,
    /// Seed the solver with the previous pose when one is known.
    pub use_prior: bool,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            reprojection_threshold: 8.0,
            confidence: 0.99,
            use_prior: true,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    /// Estimated object pose (T_co).
    pub pose: SE3,
    /// Indices of inlier correspondences.
    pub inlier_indices: Vec<usize>,
    /// Mean reprojection error over the inliers, in pixels.
    pub reproj_error: f64,
}

impl PoseEstimate {
    pub fn num_inliers(&self) -> usize {
        self.inlier_indices.len()
    }
}

/// Robust pose from 3D object points and their 2D image observations.
pub trait PoseSolver: Send + Sync {
    fn solve(
        &self,
        points3d: &[Vector3<f64>],
        points2d: &[Point2f],
        camera: &CameraModel,
        prior: Option<&SE3>,
    ) -> Result<PoseEstimate>;
}

/// OpenCV `solvePnPRansac` with the iterative refinement method.
#[derive(Debug, Clone, Default)]
pub struct RansacPnpSolver {
    config: PnpConfig,
}

impl RansacPnpSolver {
    pub fn new(config: PnpConfig) -> Self {
        Self { config }
    }
}

impl PoseSolver for RansacPnpSolver {
    fn solve(
        &self,
        points3d: &[Vector3<f64>],
        points2d: &[Point2f],
        camera: &CameraModel,
        prior: Option<&SE3>,
    ) -> Result<PoseEstimate> {
        check_correspondences(points3d, points2d)?;

        let pts3d: Vector<Point3d> = points3d
            .iter()
            .map(|p| Point3d::new(p.x, p.y, p.z))
            .collect();
        let pts2d: Vector<Point2f> = points2d.iter().copied().collect();

        let k = camera.k();
        let camera_matrix = Mat::from_slice_2d(&[
            [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
            [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
            [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
        ])?;
        let dist_coeffs = Mat::zeros(1, 5, opencv::core::CV_64F)?.to_mat()?;

        let mut rvec = Mat::default();
        let mut tvec = Mat::default();
        let mut use_extrinsic_guess = false;

        if let Some(prior_pose) = prior.filter(|_| self.config.use_prior) {
            rvec = rotation_matrix_to_rvec(prior_pose.rotation_matrix())?;
            tvec = Mat::from_slice(prior_pose.translation.as_slice())?.try_clone()?;
            use_extrinsic_guess = !rvec.empty();
        }

        let mut inliers = Vector::<i32>::new();
        let found = calib3d::solve_pnp_ransac(
            &pts3d,
            &pts2d,
            &camera_matrix,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            use_extrinsic_guess,
            self.config.iterations,
            self.config.reprojection_threshold,
            self.config.confidence,
            &mut inliers,
            calib3d::SOLVEPNP_ITERATIVE,
        )?;
        if !found {
            return Err(TrackingError::SolverFailed);
        }

        let mut rot_mat = Mat::default();
        calib3d::rodrigues(&rvec, &mut rot_mat, &mut opencv::core::no_array())?;
        let rotation = mat3_to_matrix3(&rot_mat)?;
        let translation = Vector3::new(
            *tvec.at::<f64>(0)?,
            *tvec.at::<f64>(1)?,
            *tvec.at::<f64>(2)?,
        );
        let pose = SE3::from_rt(rotation, translation);

        let inlier_indices: Vec<usize> = inliers
            .iter()
            .filter_map(|i| usize::try_from(i).ok())
            .filter(|&i| i < points3d.len())
            .collect();
        let reproj_error = mean_reprojection_error(&pose, points3d, points2d, &inlier_indices, camera);

        Ok(PoseEstimate {
            pose,
            inlier_indices,
            reproj_error,
        })
    }
}

/// Validate correspondence counts before handing them to a solver.
pub fn check_correspondences(points3d: &[Vector3<f64>], points2d: &[Point2f]) -> Result<()> {
    if points3d.len() != points2d.len() {
        return Err(TrackingError::MismatchedCorrespondences {
            points3d: points3d.len(),
            points2d: points2d.len(),
        });
    }
    if points3d.len() < MIN_PNP_CORRESPONDENCES {
        return Err(TrackingError::InsufficientCorrespondences {
            required: MIN_PNP_CORRESPONDENCES,
            actual: points3d.len(),
        });
    }
    Ok(())
}

/// Pixel distance between the projection of `point3d` under `pose` and `point2d`.
///
/// Points that do not project (behind the camera) have infinite error.
pub fn reprojection_error(
    pose: &SE3,
    point3d: &Vector3<f64>,
    point2d: &Point2f,
    camera: &CameraModel,
) -> f64 {
    match camera.project(&pose.transform_point(point3d)) {
        Some(uv) => {
            let du = uv.x - point2d.x as f64;
            let dv = uv.y - point2d.y as f64;
            (du * du + dv * dv).sqrt()
        }
        None => f64::INFINITY,
    }
}

/// Mean reprojection error over `indices`; infinite when `indices` is empty.
pub fn mean_reprojection_error(
    pose: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Point2f],
    indices: &[usize],
    camera: &CameraModel,
) -> f64 {
    if indices.is_empty() {
        return f64::INFINITY;
    }
    let total: f64 = indices
        .iter()
        .map(|&i| reprojection_error(pose, &points3d[i], &points2d[i], camera))
        .sum();
    total / indices.len() as f64
}

/// Convert rotation matrix to Rodrigues vector.
fn rotation_matrix_to_rvec(rot: Matrix3<f64>) -> Result<Mat> {
    let rows = [
        [rot[(0, 0)], rot[(0, 1)], rot[(0, 2)]],
        [rot[(1, 0)], rot[(1, 1)], rot[(1, 2)]],
        [rot[(2, 0)], rot[(2, 1)], rot[(2, 2)]],
    ];
    let rot_mat = Mat::from_slice_2d(&rows)?;
    let mut rvec = Mat::default();
    calib3d::rodrigues(&rot_mat, &mut rvec, &mut opencv::core::no_array())?;
    Ok(rvec)
}

/// Convert OpenCV 3x3 Mat to nalgebra Matrix3.
fn mat3_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut arr = [0.0f64; 9];
    for (i, v) in arr.iter_mut().enumerate() {
        *v = *mat.at::<f64>(i as i32)?;
    }
    Ok(Matrix3::from_row_slice(&arr))
}
