//! Pose solving from a single capture's 2D/3D correspondences.
//!
//! The solver mirrors the classic iterative PnP pipeline for a planar target:
//! the observed pixels are undistorted into normalized image coordinates, a
//! DLT homography from the board plane seeds a pose through the standard
//! plane-induced decomposition, and the rotation vector and translation are
//! then refined together by minimizing pixel reprojection error through the
//! full distorted projection model with `tiny_solver`'s Levenberg-Marquardt.
//! A single deterministic solve, no RANSAC or outlier rejection.

use crate::board::CorrespondenceRecord;
use crate::camera::{
    distort_normalized, matrix_to_rodrigues, rodrigues_to_matrix, CameraError, CameraIntrinsics,
};
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

#[derive(thiserror::Error, Debug)]
pub enum PoseError {
    #[error("Not enough valid correspondences: PnP needs at least 4, got {0}")]
    NotEnoughPoints(usize),
    #[error("SVD failed while estimating the board homography")]
    SvdFailed,
    #[error("Degenerate correspondence geometry: {0}")]
    DegenerateGeometry(String),
    #[error("Pose refinement did not converge")]
    NonConvergence,
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// A solved rigid pose. `rot` is always the Rodrigues expansion of `rvec`;
/// the two are kept together because the interchange format persists both.
#[derive(Debug, Clone)]
pub struct PoseRecord {
    pub rvec: Vector3<f64>,
    pub rot: Matrix3<f64>,
    pub t: Vector3<f64>,
}

impl PoseRecord {
    /// Camera center in world coordinates, `-R^T * t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -self.rot.transpose() * self.t
    }
}

/// Pose plus the diagnostics reported to the run summary (not persisted).
#[derive(Debug, Clone)]
pub struct SolvedPose {
    pub pose: PoseRecord,
    /// Mean Euclidean pixel distance between the valid observations and the
    /// reprojections of their 3D points through the solved pose.
    pub reprojection_error: f64,
}

/// Solves the camera pose from one correspondence record.
///
/// Only rows whose 2D validity marker is positive participate. Fails below 4
/// valid correspondences (PnP is underdetermined) and on degenerate geometry.
pub fn solve(
    record: &CorrespondenceRecord,
    camera: &CameraIntrinsics,
) -> Result<SolvedPose, PoseError> {
    let mut object = Vec::new();
    let mut image = Vec::new();
    for (p3, p2) in record.keypoints3d.iter().zip(record.keypoints2d.iter()) {
        if p2[2] > 0.0 {
            object.push(Vector3::new(p3[0], p3[1], p3[2]));
            image.push(Vector2::new(p2[0], p2[1]));
        }
    }
    if object.len() < 4 {
        return Err(PoseError::NotEnoughPoints(object.len()));
    }

    let mut normalized = Vec::with_capacity(image.len());
    for pixel in &image {
        normalized.push(camera.undistort_point(pixel)?);
    }

    let seed = seed_planar_pose(&object, &normalized)?;
    debug!(
        "pnp seed: rvec = {:?}, t = {:?}",
        seed.rvec.as_slice(),
        seed.t.as_slice()
    );

    let pose = refine_pose(&seed, &object, &image, camera)?;
    let reprojection_error = mean_reprojection_error(&pose, &object, &image, camera)?;
    Ok(SolvedPose {
        pose,
        reprojection_error,
    })
}

/// Mean pixel reprojection error of `pose` over the given correspondences.
pub fn mean_reprojection_error(
    pose: &PoseRecord,
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    camera: &CameraIntrinsics,
) -> Result<f64, PoseError> {
    let mut total = 0.0;
    for (pw, pi) in object.iter().zip(image.iter()) {
        let pc = pose.rot * pw + pose.t;
        let reprojected = camera.project(&pc)?;
        total += (reprojected - pi).norm();
    }
    Ok(total / object.len() as f64)
}

/// DLT homography from board-plane coordinates to normalized image
/// coordinates, solved as the null vector of the stacked constraints.
fn dlt_homography(
    object: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
) -> Result<Matrix3<f64>, PoseError> {
    let n = object.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in object.iter().zip(normalized.iter()).enumerate() {
        let (x, y) = (pw.x, pw.y);
        let (u, v) = (pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let h = v_t.row(v_t.nrows() - 1);

    let mut h_mat = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_mat[(r, c)] = h[3 * r + c];
        }
    }
    if h_mat.norm() < f64::EPSILON {
        return Err(PoseError::SvdFailed);
    }
    Ok(h_mat)
}

/// Decomposes the plane-induced homography (intrinsics already removed) into
/// a pose seed, projecting the rotation estimate onto SO(3).
fn seed_planar_pose(
    object: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
) -> Result<PoseRecord, PoseError> {
    let h = dlt_homography(object, normalized)?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm1 = h1.norm();
    let norm2 = h2.norm();
    if norm1 < f64::EPSILON || norm2 < f64::EPSILON {
        return Err(PoseError::DegenerateGeometry(
            "homography columns collapsed".to_string(),
        ));
    }
    let lambda = 2.0 / (norm1 + norm2);

    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h3 * lambda;

    // The null-vector sign is arbitrary; the board must sit in front of the
    // camera.
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);

    let mut r_mat = Matrix3::zeros();
    r_mat.set_column(0, &r1);
    r_mat.set_column(1, &r2);
    r_mat.set_column(2, &r3);

    // Polar decomposition via SVD onto SO(3).
    let svd = r_mat.svd(true, true);
    let u = svd.u.ok_or(PoseError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let mut rot = u * v_t;
    if rot.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        rot = u_flipped * v_t;
    }

    let rvec = matrix_to_rodrigues(&rot);
    Ok(PoseRecord { rvec, rot, t })
}

/// Reprojection cost over the stacked 6-vector `[rvec, tvec]`, evaluated
/// through the shared generic projection so `tiny_solver` can differentiate
/// it with dual numbers.
#[derive(Debug, Clone)]
struct ReprojectionCost {
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
    k: Matrix3<f64>,
    dist: Vec<f64>,
}

impl<T: RealField> Factor<T> for ReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let rvec = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let rot = rodrigues_to_matrix(&rvec);

        let fx = T::from_f64(self.k[(0, 0)]).unwrap();
        let fy = T::from_f64(self.k[(1, 1)]).unwrap();
        let cx = T::from_f64(self.k[(0, 2)]).unwrap();
        let cy = T::from_f64(self.k[(1, 2)]).unwrap();

        let mut residuals = DVector::zeros(self.points2d.len() * 2);
        for i in 0..self.points2d.len() {
            let p3d = &self.points3d[i];
            let p2d = &self.points2d[i];

            let pw = nalgebra::Vector3::new(
                T::from_f64(p3d.x).unwrap(),
                T::from_f64(p3d.y).unwrap(),
                T::from_f64(p3d.z).unwrap(),
            );
            let pc = rot.clone() * pw
                + nalgebra::Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

            let z_val = pc.z.clone().to_subset().unwrap_or(0.0);
            if z_val < 1e-6 {
                // Behind the camera; push the optimizer away hard.
                residuals[i * 2] = T::from_f64(1e6).unwrap();
                residuals[i * 2 + 1] = T::from_f64(1e6).unwrap();
                continue;
            }

            let x = pc.x.clone() / pc.z.clone();
            let y = pc.y.clone() / pc.z.clone();
            let (xd, yd) = distort_normalized(&self.dist, x, y);

            let u = fx.clone() * xd + cx.clone();
            let v = fy.clone() * yd + cy.clone();
            residuals[i * 2] = u - T::from_f64(p2d.x).unwrap();
            residuals[i * 2 + 1] = v - T::from_f64(p2d.y).unwrap();
        }
        residuals
    }
}

/// Levenberg-Marquardt refinement of the seed pose against the observed
/// (distorted) pixel coordinates.
fn refine_pose(
    seed: &PoseRecord,
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    camera: &CameraIntrinsics,
) -> Result<PoseRecord, PoseError> {
    let mut problem = tiny_solver::Problem::new();
    let cost = ReprojectionCost {
        points3d: object.to_vec(),
        points2d: image.to_vec(),
        k: camera.k,
        dist: camera.dist.clone(),
    };
    let num_residuals = image.len() * 2;
    problem.add_residual_block(num_residuals, &["pose"], Box::new(cost), None);

    let initial = DVector::from_vec(vec![
        seed.rvec.x, seed.rvec.y, seed.rvec.z, seed.t.x, seed.t.y, seed.t.z,
    ]);
    let mut initial_values = HashMap::new();
    initial_values.insert("pose".to_string(), initial);

    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, None)
        .ok_or(PoseError::NonConvergence)?;

    let pose = result.get("pose").ok_or(PoseError::NonConvergence)?;
    if pose.iter().any(|v| !v.is_finite()) {
        return Err(PoseError::NonConvergence);
    }

    let rvec = Vector3::new(pose[0], pose[1], pose[2]);
    let rot = rodrigues_to_matrix(&[pose[0], pose[1], pose[2]]);
    let t = Vector3::new(pose[3], pose[4], pose[5]);
    Ok(PoseRecord { rvec, rot, t })
}
