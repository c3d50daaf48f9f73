use std::path::Path;

use nalgebra::{Matrix3, Vector3};

use crate::calibfile::{self, CalibFileError};
use crate::segment::SegmentedFrame;
use crate::source::DepthIntrinsics;

/// Rigid transform taking camera frame to world frame, stored in the
/// row-vector convention of the persisted format: `p' = p·R + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTransform {
    pub rot: Matrix3<f32>,
    pub origin: Vector3<f32>,
}

impl Default for CalibrationTransform {
    fn default() -> Self {
        Self {
            rot: Matrix3::identity(),
            origin: Vector3::zeros(),
        }
    }
}

impl CalibrationTransform {
    /// Applies `p·R + t` to a single point.
    pub fn apply(&self, p: &Vector3<f32>) -> Vector3<f32> {
        self.rot.tr_mul(p) + self.origin
    }
}

/// A growable ordered point cloud, reused between frames, together with the
/// active calibration transform. Row order is preserved across transforms.
pub struct PointCloud {
    points: Vec<Vector3<f32>>,
    pub transform: CalibrationTransform,
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl PointCloud {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            transform: CalibrationTransform::default(),
        }
    }

    /// Logically clears the cloud. Use this in-between frames.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn add_point(&mut self, point: Vector3<f32>) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Vector3<f32>] {
        &self.points
    }

    /// Deprojects every retained pixel of a segmented frame and appends the
    /// camera-frame points to the cloud. `intrinsics` describe the full-size
    /// frame; they are rescaled to the segmenter's downsampled grid here.
    pub fn to_depth_frame(
        &mut self,
        frame: &SegmentedFrame<'_>,
        intrinsics: &DepthIntrinsics,
        depth_scale: f32,
    ) {
        let intrinsics = intrinsics.scaled_to(frame.width as u32, frame.height as u32);
        for (x, y, depth) in frame.retained_pixels() {
            let z = depth as f32 * depth_scale;
            self.points
                .push(intrinsics.deproject(x as f32, y as f32, z));
        }
    }

    /// Applies the active calibration transform to every point in place.
    pub fn transform_cloud(&mut self) {
        for p in &mut self.points {
            *p = self.transform.rot.tr_mul(p) + self.transform.origin;
        }
    }

    pub fn save_calibration(&self, path: impl AsRef<Path>) -> Result<(), CalibFileError> {
        calibfile::save(path.as_ref(), &self.transform)
    }

    pub fn load_calibration(&mut self, path: impl AsRef<Path>) -> Result<(), CalibFileError> {
        self.transform = calibfile::load(path.as_ref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_transform_is_identity() {
        let transform = CalibrationTransform::default();
        let p = Vector3::new(0.3, -0.2, 1.1);
        assert_eq!(transform.apply(&p), p);
    }

    #[test]
    fn test_apply_uses_row_vector_convention() {
        // a rotation of +90 degrees about Z in the row convention maps the
        // row vector (1, 0, 0) to (0, -1, 0): p' = p·R
        let transform = CalibrationTransform {
            rot: Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0),
            origin: Vector3::new(0.0, 0.0, 0.5),
        };
        let p = transform.apply(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p.x, 0.0);
        assert_relative_eq!(p.y, -1.0);
        assert_relative_eq!(p.z, 0.5);
    }

    #[test]
    fn test_transform_preserves_row_order() {
        let mut cloud = PointCloud::new();
        cloud.add_point(Vector3::new(1.0, 0.0, 0.0));
        cloud.add_point(Vector3::new(0.0, 1.0, 0.0));
        cloud.add_point(Vector3::new(0.0, 0.0, 1.0));
        cloud.transform = CalibrationTransform {
            rot: Matrix3::identity(),
            origin: Vector3::new(0.0, 0.0, -1.0),
        };
        cloud.transform_cloud();
        assert_eq!(cloud.points()[0], Vector3::new(1.0, 0.0, -1.0));
        assert_eq!(cloud.points()[1], Vector3::new(0.0, 1.0, -1.0));
        assert_eq!(cloud.points()[2], Vector3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_deprojection_of_segmented_frame() {
        use crate::segment::FrameSegmenter;

        // a single 2x2 block of valid depth at 1000 units of 1 mm each
        let mut img = vec![0u16; 8 * 8];
        for y in 3..5 {
            for x in 3..5 {
                img[y * 8 + x] = 1000;
            }
        }
        let mut segmenter = FrameSegmenter::new(1.0, 0.05, 1);
        let frame = segmenter.segment(&img, 8, 8, 0.001);

        let intrinsics = DepthIntrinsics {
            fx: 8.0,
            fy: 8.0,
            cx: 4.0,
            cy: 4.0,
            width: 8,
            height: 8,
        };
        let mut cloud = PointCloud::new();
        cloud.to_depth_frame(&frame, &intrinsics, 0.001);

        assert_eq!(cloud.len(), 4);
        assert!(cloud.points().iter().all(|p| (p.z - 1.0).abs() < 1e-6));
        // pixel (3, 3) sits one eighth of the focal plane from the center
        let expected = (3.0 - 4.0) * 1.0 / 8.0;
        assert_relative_eq!(cloud.points()[0].x, expected, epsilon = 1e-6);
        assert_relative_eq!(cloud.points()[0].y, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_clear_keeps_transform() {
        let mut cloud = PointCloud::new();
        cloud.transform.origin = Vector3::new(0.1, 0.2, 0.3);
        cloud.add_point(Vector3::zeros());
        cloud.clear();
        assert!(cloud.is_empty());
        assert_relative_eq!(cloud.transform.origin.x, 0.1);
    }
}
