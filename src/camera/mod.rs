//! Camera intrinsics and the radial-tangential projection model.
//!
//! A rig camera is described by a 3x3 projection matrix `K` and a distortion
//! coefficient vector of length 4, 5 or 8 (`k1, k2, p1, p2[, k3[, k4, k5, k6]]`,
//! the 8-coefficient form being the rational model). This module provides
//! projection of camera-frame points into distorted pixel coordinates, the
//! inverse (iterative point undistortion) and Rodrigues conversions between
//! rotation vectors and rotation matrices.

use nalgebra::{Matrix3, RealField, Vector2, Vector3};

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Distortion vector must have 4, 5 or 8 coefficients, got {0}")]
    BadDistortionLength(usize),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
}

/// Intrinsic parameters of a single rig camera: projection matrix and
/// distortion coefficients, exactly as loaded from the intrinsics file.
#[derive(Debug, Clone)]
pub struct CameraIntrinsics {
    /// 3x3 projection matrix (focal lengths on the diagonal, principal point
    /// in the last column).
    pub k: Matrix3<f64>,
    /// Distortion coefficients, length 4, 5 or 8.
    pub dist: Vec<f64>,
}

impl CameraIntrinsics {
    pub fn new(k: Matrix3<f64>, dist: Vec<f64>) -> Result<Self, CameraError> {
        let model = CameraIntrinsics { k, dist };
        model.validate_params()?;
        Ok(model)
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

    pub fn validate_params(&self) -> Result<(), CameraError> {
        if self.fx() <= 0.0 || self.fy() <= 0.0 {
            return Err(CameraError::FocalLengthMustBePositive);
        }
        if !self.cx().is_finite() || !self.cy().is_finite() {
            return Err(CameraError::PrincipalPointMustBeFinite);
        }
        if !matches!(self.dist.len(), 4 | 5 | 8) {
            return Err(CameraError::BadDistortionLength(self.dist.len()));
        }
        Ok(())
    }

    /// Projects a camera-frame 3D point into distorted pixel coordinates.
    pub fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraError::PointAtCameraCenter);
        }

        let x_prime = point_3d.x / point_3d.z;
        let y_prime = point_3d.y / point_3d.z;

        let (xd, yd) = distort_normalized(&self.dist, x_prime, y_prime);

        let u = self.fx() * xd + self.cx();
        let v = self.fy() * yd + self.cy();
        Ok(Vector2::new(u, v))
    }

    /// Undistorts a pixel coordinate into normalized image coordinates
    /// `(x, y)` such that `distort(x, y)` reproduces the observed pixel.
    ///
    /// Uses the classic fixed-point iteration on the compensated radial
    /// factor, which also covers the 8-coefficient rational model where a
    /// closed-form Newton step is unwieldy.
    pub fn undistort_point(&self, point_2d: &Vector2<f64>) -> Result<Vector2<f64>, CameraError> {
        let x0 = (point_2d.x - self.cx()) / self.fx();
        let y0 = (point_2d.y - self.cy()) / self.fy();

        let d = &self.dist;
        let k1 = d[0];
        let k2 = d[1];
        let p1 = d[2];
        let p2 = d[3];
        let k3 = if d.len() > 4 { d[4] } else { 0.0 };
        let (k4, k5, k6) = if d.len() == 8 {
            (d[5], d[6], d[7])
        } else {
            (0.0, 0.0, 0.0)
        };

        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let mut x = x0;
        let mut y = y0;
        for _ in 0..MAX_ITERATIONS {
            let r2 = x * x + y * y;
            let num = 1.0 + r2 * (k4 + r2 * (k5 + r2 * k6));
            let den = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            if den.abs() < f64::EPSILON {
                return Err(CameraError::NumericalError(
                    "Radial distortion factor vanished during undistortion".to_string(),
                ));
            }
            let icdist = num / den;
            let delta_x = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let delta_y = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            let x_new = (x0 - delta_x) * icdist;
            let y_new = (y0 - delta_y) * icdist;
            let step = ((x_new - x).powi(2) + (y_new - y).powi(2)).sqrt();
            x = x_new;
            y = y_new;
            if step < EPS {
                break;
            }
        }

        if !x.is_finite() || !y.is_finite() {
            return Err(CameraError::NumericalError(
                "Point undistortion diverged".to_string(),
            ));
        }
        Ok(Vector2::new(x, y))
    }

    /// Undistorts a pixel coordinate and re-applies `K`, yielding the pixel
    /// position of the same ray in the undistorted image plane.
    pub fn undistort_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector2<f64>, CameraError> {
        let n = self.undistort_point(point_2d)?;
        Ok(Vector2::new(
            self.fx() * n.x + self.cx(),
            self.fy() * n.y + self.cy(),
        ))
    }
}

/// Applies radial-tangential distortion to normalized image coordinates.
///
/// Generic over the scalar so the same code path serves both plain `f64`
/// evaluation and dual-number autodiff inside the pose refinement factor.
pub fn distort_normalized<T: RealField>(dist: &[f64], x: T, y: T) -> (T, T) {
    let k1 = T::from_f64(dist[0]).unwrap();
    let k2 = T::from_f64(dist[1]).unwrap();
    let p1 = T::from_f64(dist[2]).unwrap();
    let p2 = T::from_f64(dist[3]).unwrap();
    let k3 = T::from_f64(if dist.len() > 4 { dist[4] } else { 0.0 }).unwrap();

    let one = T::from_f64(1.0).unwrap();
    let two = T::from_f64(2.0).unwrap();

    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let radial_num = one.clone() + r2.clone() * (k1 + r2.clone() * (k2 + r2.clone() * k3));
    let radial = if dist.len() == 8 {
        let k4 = T::from_f64(dist[5]).unwrap();
        let k5 = T::from_f64(dist[6]).unwrap();
        let k6 = T::from_f64(dist[7]).unwrap();
        let radial_den = one + r2.clone() * (k4 + r2.clone() * (k5 + r2.clone() * k6));
        radial_num / radial_den
    } else {
        radial_num
    };

    let xd = x.clone() * radial.clone()
        + two.clone() * p1.clone() * x.clone() * y.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
    let yd = y.clone() * radial + p1 * (r2 + two.clone() * y.clone() * y.clone()) + two * p2 * x * y;
    (xd, yd)
}

/// Expands a Rodrigues rotation vector into a 3x3 rotation matrix.
///
/// Generic over the scalar for the same autodiff reason as
/// [`distort_normalized`]. Falls back to the second-order Taylor expansion of
/// `sin(t)/t` and `(1-cos(t))/t^2` near zero so the expression stays smooth.
pub fn rodrigues_to_matrix<T: RealField>(rvec: &[T; 3]) -> Matrix3<T> {
    let x = rvec[0].clone();
    let y = rvec[1].clone();
    let z = rvec[2].clone();
    let theta2 = x.clone() * x.clone() + y.clone() * y.clone() + z.clone() * z.clone();
    let theta2_val = theta2.clone().to_subset().unwrap_or(0.0);

    let one = T::from_f64(1.0).unwrap();
    let (a, b) = if theta2_val < 1e-14 {
        // sin(t)/t ~ 1 - t^2/6, (1-cos(t))/t^2 ~ 1/2 - t^2/24
        let a = one.clone() - theta2.clone() / T::from_f64(6.0).unwrap();
        let b = T::from_f64(0.5).unwrap() - theta2.clone() / T::from_f64(24.0).unwrap();
        (a, b)
    } else {
        let theta = theta2.clone().sqrt();
        let a = theta.clone().sin() / theta.clone();
        let b = (one.clone() - theta.clone().cos()) / theta2.clone();
        (a, b)
    };

    let zero = T::from_f64(0.0).unwrap();
    let skew = Matrix3::new(
        zero.clone(),
        -z.clone(),
        y.clone(),
        z.clone(),
        zero.clone(),
        -x.clone(),
        -y.clone(),
        x.clone(),
        zero,
    );

    Matrix3::identity() + skew.clone() * a + skew.clone() * skew * b
}

/// Recovers the Rodrigues rotation vector from a rotation matrix.
pub fn matrix_to_rodrigues(rot: &Matrix3<f64>) -> Vector3<f64> {
    let trace = rot.trace();
    let cos_theta = ((trace - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    let axis_raw = Vector3::new(
        rot[(2, 1)] - rot[(1, 2)],
        rot[(0, 2)] - rot[(2, 0)],
        rot[(1, 0)] - rot[(0, 1)],
    );

    if theta < 1e-10 {
        return axis_raw * 0.5;
    }
    if (std::f64::consts::PI - theta).abs() < 1e-6 {
        // Near pi the off-diagonal differences vanish; recover the axis from
        // the diagonal of R = I + 2*sin^2(t/2)*(aa^T - I).
        let xx = ((rot[(0, 0)] + 1.0) * 0.5).max(0.0).sqrt();
        let yy = ((rot[(1, 1)] + 1.0) * 0.5).max(0.0).sqrt();
        let zz = ((rot[(2, 2)] + 1.0) * 0.5).max(0.0).sqrt();
        let mut axis = Vector3::new(xx, yy, zz);
        if rot[(0, 1)] + rot[(1, 0)] < 0.0 {
            axis.y = -axis.y;
        }
        if rot[(0, 2)] + rot[(2, 0)] < 0.0 {
            axis.z = -axis.z;
        }
        return axis * theta;
    }

    axis_raw * (theta / (2.0 * theta.sin()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_intrinsics() -> CameraIntrinsics {
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        CameraIntrinsics::new(k, vec![-0.28, 0.07, 0.0002, 0.00002, 0.0]).unwrap()
    }

    #[test]
    fn test_accessors_match_matrix() {
        let cam = sample_intrinsics();
        assert_eq!(cam.fx(), 500.0);
        assert_eq!(cam.fy(), 500.0);
        assert_eq!(cam.cx(), 320.0);
        assert_eq!(cam.cy(), 240.0);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let k = Matrix3::new(-1.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        assert!(CameraIntrinsics::new(k, vec![0.0; 5]).is_err());

        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        assert!(matches!(
            CameraIntrinsics::new(k, vec![0.0; 3]),
            Err(CameraError::BadDistortionLength(3))
        ));
    }

    #[test]
    fn test_project_then_undistort_round_trip() {
        let cam = sample_intrinsics();
        let point_3d = Vector3::new(0.1, -0.05, 1.0);
        let pixel = cam.project(&point_3d).unwrap();
        let normalized = cam.undistort_point(&pixel).unwrap();
        assert_relative_eq!(normalized.x, 0.1, epsilon = 1e-8);
        assert_relative_eq!(normalized.y, -0.05, epsilon = 1e-8);
    }

    #[test]
    fn test_project_rejects_point_at_camera_center() {
        let cam = sample_intrinsics();
        assert!(matches!(
            cam.project(&Vector3::new(0.1, 0.1, 0.0)),
            Err(CameraError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_rational_model_round_trip() {
        let k = Matrix3::new(600.0, 0.0, 400.0, 0.0, 610.0, 300.0, 0.0, 0.0, 1.0);
        let cam = CameraIntrinsics::new(
            k,
            vec![0.1, -0.02, 0.001, -0.001, 0.003, 0.05, -0.01, 0.002],
        )
        .unwrap();
        let pixel = cam.project(&Vector3::new(-0.2, 0.15, 2.0)).unwrap();
        let normalized = cam.undistort_point(&pixel).unwrap();
        assert_relative_eq!(normalized.x, -0.1, epsilon = 1e-8);
        assert_relative_eq!(normalized.y, 0.075, epsilon = 1e-8);
    }

    #[test]
    fn test_rodrigues_round_trip() {
        let rvec = Vector3::new(0.3, -0.2, 0.5);
        let rot = rodrigues_to_matrix(&[rvec.x, rvec.y, rvec.z]);
        assert_relative_eq!(rot.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(
            (rot.transpose() * rot - Matrix3::identity()).norm(),
            0.0,
            epsilon = 1e-12
        );

        let back = matrix_to_rodrigues(&rot);
        assert_relative_eq!(back.x, rvec.x, epsilon = 1e-10);
        assert_relative_eq!(back.y, rvec.y, epsilon = 1e-10);
        assert_relative_eq!(back.z, rvec.z, epsilon = 1e-10);
    }

    #[test]
    fn test_rodrigues_small_angle() {
        let rot = rodrigues_to_matrix(&[1e-9, 0.0, 0.0]);
        assert_relative_eq!(rot[(2, 1)], 1e-9, epsilon = 1e-15);
        let back = matrix_to_rodrigues(&rot);
        assert_relative_eq!(back.x, 1e-9, epsilon = 1e-15);
    }
}
