use nalgebra::Vector3;

/// Pinhole intrinsics of a depth stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: u32,
    pub height: u32,
}

impl DepthIntrinsics {
    /// Maps pixel `(u, v)` with metric depth `z` into camera-frame coordinates.
    pub fn deproject(&self, u: f32, v: f32, z: f32) -> Vector3<f32> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Rescales the intrinsics to a resampled image size. The field of view is
    /// unchanged, so the focal lengths and principal point scale with the
    /// resolution.
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            width,
            height,
        }
    }
}

/// A depth camera (or a stand-in for one) that the pipeline can poll.
///
/// Value 0 in a depth frame means "no data". Nonzero samples multiplied by
/// [`DepthSource::depth_scale`] yield metric depth in meters.
pub trait DepthSource {
    fn intrinsics(&self) -> DepthIntrinsics;

    /// Meters per depth unit.
    fn depth_scale(&self) -> f32;

    /// Blocks until the next depth frame arrives. The returned slice is
    /// row-major `width × height` and is only valid until the next call.
    fn wait_for_frame(&mut self) -> Result<&[u16], Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> DepthIntrinsics {
        DepthIntrinsics {
            fx: 600.0,
            fy: 600.0,
            cx: 320.0,
            cy: 240.0,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn test_deproject_principal_point() {
        let p = intrinsics().deproject(320.0, 240.0, 1.5);
        assert_relative_eq!(p.x, 0.0);
        assert_relative_eq!(p.y, 0.0);
        assert_relative_eq!(p.z, 1.5);
    }

    #[test]
    fn test_deproject_off_center() {
        let p = intrinsics().deproject(380.0, 240.0, 2.0);
        // 60 px at fx = 600 and z = 2 is 0.2 m to the right
        assert_relative_eq!(p.x, 0.2, epsilon = 1e-6);
        assert_relative_eq!(p.y, 0.0);
    }

    #[test]
    fn test_scaled_intrinsics_preserve_rays() {
        let full = intrinsics();
        let scaled = full.scaled_to(128, 96);
        let a = full.deproject(320.0, 240.0, 1.0);
        let b = scaled.deproject(64.0, 48.0, 1.0);
        assert_relative_eq!(a.x, b.x, epsilon = 1e-5);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-5);
    }
}
