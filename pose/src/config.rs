use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

/// Tunables of the pipeline. Defaults match the values the system was tuned
/// with; any subset can be overridden from `pose.toml` in the working
/// directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoseConfig {
    /// Depth-image downsample factor in calibration mode.
    pub point_cloud_scaling_calib: f32,
    /// Depth-image downsample factor in tracking mode.
    pub point_cloud_scaling_tracking: f32,
    /// Segmenter neighborhood radius in pixels.
    pub prefilter_manhattan_dist: usize,
    /// Segmenter per-step depth tolerance in meters.
    pub prefilter_depth_max_dist: f32,
    pub kmeans_k: usize,
    pub kmeans_attempts: usize,
    pub kmeans_iterations: usize,
    pub kmeans_epsilon: f64,
    pub kmeans_connect_threshold: f32,
    /// Seed hand positions in the calibrated frame.
    pub left_arm_start_pos: [f32; 3],
    pub right_arm_start_pos: [f32; 3],
    /// Max distance between a seed and its hand cluster, meters.
    pub hand_max_dist_to_start: f32,
    /// Arm-walk slope cutoff.
    pub shoulder_dxdz_threshold: f32,
    /// Temporal smoothing factor for the joint locations.
    pub joint_smoothing: f32,
    /// Below this elbow angle (degrees) an arm is displayed as locked.
    pub arm_locked_angle_threshold_d: f32,
    /// Frames an arm may go undetected before its smoothed state is stale.
    pub max_missed_steps: u64,
    pub calibration_path: PathBuf,
    /// Optional path to dump the segmentation mask of the calibration frame.
    pub mask_snapshot: Option<PathBuf>,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            point_cloud_scaling_calib: 0.2,
            point_cloud_scaling_tracking: 0.16,
            prefilter_manhattan_dist: 4,
            prefilter_depth_max_dist: 0.05,
            kmeans_k: 30,
            kmeans_attempts: 2,
            kmeans_iterations: 10,
            kmeans_epsilon: 0.002,
            kmeans_connect_threshold: 0.25,
            left_arm_start_pos: [0.2, 0.0, -0.05],
            right_arm_start_pos: [-0.2, 0.0, -0.05],
            hand_max_dist_to_start: 0.2,
            shoulder_dxdz_threshold: 1.2,
            joint_smoothing: 0.11,
            arm_locked_angle_threshold_d: 23.0,
            max_missed_steps: 5,
            calibration_path: PathBuf::from("calibration.xml"),
            mask_snapshot: None,
        }
    }
}

impl PoseConfig {
    /// Loads `pose.toml` from the working directory if present; otherwise
    /// the defaults. A malformed file is a startup error, not something to
    /// silently run without.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("pose.toml"))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_the_tuned_values() {
        let config = PoseConfig::default();
        assert_eq!(config.kmeans_k, 30);
        assert_eq!(config.prefilter_manhattan_dist, 4);
        assert_eq!(config.left_arm_start_pos, [0.2, 0.0, -0.05]);
        assert_eq!(config.right_arm_start_pos, [-0.2, 0.0, -0.05]);
        assert_eq!(config.calibration_path, PathBuf::from("calibration.xml"));
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config: PoseConfig = toml::from_str("kmeans_k = 12\njoint_smoothing = 0.5").unwrap();
        assert_eq!(config.kmeans_k, 12);
        assert_eq!(config.joint_smoothing, 0.5);
        assert_eq!(config.kmeans_attempts, 2);
        assert_eq!(config.hand_max_dist_to_start, 0.2);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(toml::from_str::<PoseConfig>("kmaens_k = 12").is_err());
    }
}
