//! Tracking mode: the per-frame pipeline
//! segment → deproject → transform → cluster → connect → trace arms.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::anyhow;
use brachial::calibfile::CalibFileError;
use brachial::{Arm, Clusterer, FrameSegmenter, PointCloud};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::camera;
use crate::config::PoseConfig;

const FPS_WINDOW_FRAMES: u32 = 60;

pub fn run(config: &PoseConfig, running: &AtomicBool) -> anyhow::Result<()> {
    let mut source = camera::open_default_source()?;
    let intrinsics = source.intrinsics();
    let depth_scale = source.depth_scale();

    let mut segmenter = FrameSegmenter::new(
        config.point_cloud_scaling_tracking,
        config.prefilter_depth_max_dist,
        config.prefilter_manhattan_dist,
    );
    let mut cloud = PointCloud::new();
    match cloud.load_calibration(&config.calibration_path) {
        Ok(()) => info!(
            "loaded calibration from {}",
            config.calibration_path.display()
        ),
        Err(CalibFileError::Io(ref e)) if e.kind() == ErrorKind::NotFound => warn!(
            "calibration file {} not found; tracking in the raw camera frame",
            config.calibration_path.display()
        ),
        Err(e) => return Err(e.into()),
    }

    let mut clusterer = Clusterer::new(config.kmeans_k);
    let mut left_arm = Arm::new(
        Vector3::from(config.left_arm_start_pos),
        config.hand_max_dist_to_start,
        config.shoulder_dxdz_threshold,
        config.max_missed_steps,
    );
    let mut right_arm = Arm::new(
        Vector3::from(config.right_arm_start_pos),
        config.hand_max_dist_to_start,
        config.shoulder_dxdz_threshold,
        config.max_missed_steps,
    );
    let mut left_locked = false;
    let mut right_locked = false;

    let mut window_start = Instant::now();
    let mut window_frames = 0u32;

    info!("tracking");
    while running.load(Ordering::Acquire) {
        let depth = source
            .wait_for_frame()
            .map_err(|e| anyhow!("depth source failed: {e}"))?;
        let frame = segmenter.segment(
            depth,
            intrinsics.width as usize,
            intrinsics.height as usize,
            depth_scale,
        );
        let retained = frame.retained;

        cloud.clear();
        cloud.to_depth_frame(&frame, &intrinsics, depth_scale);
        cloud.transform_cloud();

        clusterer.update_point_cloud(&cloud);
        let clustered = clusterer.cluster(
            config.kmeans_attempts,
            config.kmeans_iterations,
            config.kmeans_epsilon,
        );
        let (left_tracked, right_tracked) = if clustered {
            clusterer.connect_means(config.kmeans_connect_threshold);
            (
                left_arm.update_joints(&clusterer.centers, &clusterer.adj, config.joint_smoothing),
                right_arm.update_joints(&clusterer.centers, &clusterer.adj, config.joint_smoothing),
            )
        } else {
            // no usable clusters this frame; tick the arms so their grace
            // windows still expire
            (
                left_arm.update_joints(&[], &clusterer.adj, config.joint_smoothing),
                right_arm.update_joints(&[], &clusterer.adj, config.joint_smoothing),
            )
        };

        left_locked = report_lock_state("left", &left_arm, left_tracked, left_locked, config);
        right_locked = report_lock_state("right", &right_arm, right_tracked, right_locked, config);

        debug!(
            retained,
            cloud_rows = cloud.len(),
            left_tracked,
            left_chain = left_arm.kmean_ind().len(),
            right_tracked,
            right_chain = right_arm.kmean_ind().len(),
            "frame"
        );

        window_frames += 1;
        if window_frames == FPS_WINDOW_FRAMES {
            let fps = window_frames as f32 / window_start.elapsed().as_secs_f32();
            debug!(fps, "frame rate");
            window_start = Instant::now();
            window_frames = 0;
        }
    }

    info!("tracking stopped");
    Ok(())
}

/// Display-only classification: an arm held straight is reported as locked.
/// Transitions are logged for downstream renderers that color locked arms
/// differently.
fn report_lock_state(
    name: &str,
    arm: &Arm,
    tracked: bool,
    was_locked: bool,
    config: &PoseConfig,
) -> bool {
    let locked = tracked && is_locked(arm.bend_angle(), config.arm_locked_angle_threshold_d);
    if locked != was_locked {
        debug!(
            arm = name,
            bend_angle = arm.bend_angle(),
            locked,
            "lock state changed"
        );
    }
    locked
}

/// A straight arm reads a bend angle of 180 degrees, so the threshold bounds
/// the deviation from full extension.
fn is_locked(bend_angle: f32, threshold_d: f32) -> bool {
    bend_angle > 180.0 - threshold_d
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn test_locked_means_nearly_full_extension() {
        assert!(is_locked(180.0, 23.0));
        assert!(is_locked(160.0, 23.0));
        assert!(!is_locked(150.0, 23.0));
        // a folded elbow is the opposite of locked
        assert!(!is_locked(20.0, 23.0));
    }

    #[test]
    fn test_straight_traced_arm_reports_locked() {
        // a collinear chain climbing in z: the elbow sits on the
        // hand-shoulder line, so the arm is fully extended
        let centers = vec![
            Vector3::new(0.18, 0.0, -0.05),
            Vector3::new(0.16, 0.0, 0.05),
            Vector3::new(0.14, 0.0, 0.15),
        ];
        let mut adj = DMatrix::zeros(3, 3);
        for i in 0..2 {
            adj[(i, i + 1)] = 1.0;
            adj[(i + 1, i)] = 1.0;
        }

        let config = PoseConfig::default();
        let mut arm = Arm::new(
            Vector3::new(0.2, 0.0, -0.05),
            config.hand_max_dist_to_start,
            config.shoulder_dxdz_threshold,
            config.max_missed_steps,
        );
        let tracked = arm.update_joints(&centers, &adj, config.joint_smoothing);
        assert!(tracked);
        assert!(report_lock_state("right", &arm, tracked, false, &config));
    }

    #[test]
    fn test_bent_traced_arm_is_not_locked() {
        // the chain turns a right angle at the elbow (bending in y, which
        // the walk's lateral slope cutoff does not constrain)
        let centers = vec![
            Vector3::new(0.18, 0.0, -0.05),
            Vector3::new(0.18, 0.1, 0.05),
            Vector3::new(0.18, 0.0, 0.15),
        ];
        let mut adj = DMatrix::zeros(3, 3);
        for i in 0..2 {
            adj[(i, i + 1)] = 1.0;
            adj[(i + 1, i)] = 1.0;
        }

        let config = PoseConfig::default();
        let mut arm = Arm::new(
            Vector3::new(0.2, 0.0, -0.05),
            config.hand_max_dist_to_start,
            config.shoulder_dxdz_threshold,
            config.max_missed_steps,
        );
        let tracked = arm.update_joints(&centers, &adj, config.joint_smoothing);
        assert!(tracked);
        assert!(!report_lock_state("right", &arm, tracked, false, &config));
    }
}
