//! Self-calibration against a flat rectangular reference object.
//!
//! The scene is assumed to contain only the top face of the reference object.
//! A least-squares plane gives the world Z axis, the dominant line of the
//! cloud gives the world Y axis, and their cross product gives X. The
//! rotation is composed from three successive axis rotations so that no
//! decomposition of a full basis matrix is needed.

use nalgebra::{Matrix3, Vector3};

use crate::cloud::CalibrationTransform;

/// Derives the calibration transform from the current cloud, or `None` when
/// the cloud holds fewer than 3 points or the plane fit is degenerate.
///
/// On success, applying the transform maps the fitted plane to `z = 0`, the
/// dominant line onto the Y axis, and the cloud centroid to the origin.
pub fn transform_from_cloud(points: &[Vector3<f32>]) -> Option<CalibrationTransform> {
    if points.len() < 3 {
        return None;
    }

    let origin = points.iter().sum::<Vector3<f32>>() / points.len() as f32;

    let z_vec = plane_normal(points)?;
    let mut y_vec = principal_direction(points, &origin);
    if y_vec.z < 0.0 {
        y_vec = -y_vec;
    }
    let x_vec = z_vec.cross(&y_vec);

    // rotate about Z to bring the X axis into the XZ plane, then about Y to
    // land it on +X
    let z_rot_theta = x_vec.y.atan2(x_vec.x);
    let y_rot_theta = -x_vec.z.atan2((x_vec.x * x_vec.x + x_vec.y * x_vec.y).sqrt());

    let z_rot = Matrix3::new(
        z_rot_theta.cos(),
        -z_rot_theta.sin(),
        0.0,
        z_rot_theta.sin(),
        z_rot_theta.cos(),
        0.0,
        0.0,
        0.0,
        1.0,
    );
    let y_rot = Matrix3::new(
        y_rot_theta.cos(),
        0.0,
        y_rot_theta.sin(),
        0.0,
        1.0,
        0.0,
        -y_rot_theta.sin(),
        0.0,
        y_rot_theta.cos(),
    );
    let mut rot = z_rot * y_rot;

    // the remaining freedom is a roll about X; pick it so the plane normal
    // lands on the Z axis
    let z_transformed = rot.tr_mul(&z_vec);
    let x_rot_theta = -z_transformed.y.atan2(z_transformed.z);
    let x_rot = Matrix3::new(
        1.0,
        0.0,
        0.0,
        0.0,
        x_rot_theta.cos(),
        -x_rot_theta.sin(),
        0.0,
        x_rot_theta.sin(),
        x_rot_theta.cos(),
    );
    rot *= x_rot;

    let origin = -rot.tr_mul(&origin);
    Some(CalibrationTransform { rot, origin })
}

/// Ordinary least squares fit of `z = b0 + b1·x + b2·y`; the plane normal is
/// `(b1, b2, -1)`. Unnormalized, only the direction matters downstream.
fn plane_normal(points: &[Vector3<f32>]) -> Option<Vector3<f32>> {
    let mut xtx = Matrix3::<f64>::zeros();
    let mut xty = Vector3::<f64>::zeros();
    for p in points {
        let row = Vector3::new(1.0, p.x as f64, p.y as f64);
        xtx += row * row.transpose();
        xty += row * p.z as f64;
    }
    let beta = xtx.try_inverse()? * xty;
    if !beta.y.is_finite() || !beta.z.is_finite() {
        return None;
    }
    Some(Vector3::new(beta.y as f32, beta.z as f32, -1.0))
}

/// Total-least-squares 3D line fit: the unit principal axis of the centered
/// covariance, i.e. the L2 case of a robust line fit.
fn principal_direction(points: &[Vector3<f32>], origin: &Vector3<f32>) -> Vector3<f32> {
    let mut cov = Matrix3::<f64>::zeros();
    for p in points {
        let d = (p - origin).cast::<f64>();
        cov += d * d.transpose();
    }
    let eigen = cov.symmetric_eigen();
    let (largest, _) = eigen.eigenvalues.argmax();
    let direction = eigen.eigenvectors.column(largest).into_owned();
    Vector3::new(direction.x as f32, direction.y as f32, direction.z as f32)
}

/// Parses a manual calibration nudge of the form `x, y, z`.
pub fn parse_offset(input: &str) -> Option<Vector3<f32>> {
    let mut parts = input.trim().split(',');
    let x = parts.next()?.trim().parse().ok()?;
    let y = parts.next()?.trim().parse().ok()?;
    let z = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Vector3::new(x, y, z))
}
