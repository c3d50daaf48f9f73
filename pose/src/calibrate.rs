//! Calibration mode: the user places a flat rectangular reference object in
//! view so the camera sees only its top face; frames are segmented and fed to
//! the calibrator until a transform comes out, which is then nudged by an
//! optional manual offset and saved.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail};
use brachial::calibrate::{parse_offset, transform_from_cloud};
use brachial::{FrameSegmenter, PointCloud};
use tracing::{debug, info, warn};

use crate::camera;
use crate::config::PoseConfig;

pub fn run(config: &PoseConfig, running: &AtomicBool) -> anyhow::Result<()> {
    let mut source = camera::open_default_source()?;
    let intrinsics = source.intrinsics();
    let depth_scale = source.depth_scale();

    let mut segmenter = FrameSegmenter::new(
        config.point_cloud_scaling_calib,
        config.prefilter_depth_max_dist,
        config.prefilter_manhattan_dist,
    );
    let mut cloud = PointCloud::new();

    info!("calibrating: waiting for a clean view of the reference surface");
    loop {
        if !running.load(Ordering::Acquire) {
            bail!("calibration interrupted before a transform was found");
        }

        let depth = source
            .wait_for_frame()
            .map_err(|e| anyhow!("depth source failed: {e}"))?;
        let frame = segmenter.segment(
            depth,
            intrinsics.width as usize,
            intrinsics.height as usize,
            depth_scale,
        );

        cloud.clear();
        cloud.to_depth_frame(&frame, &intrinsics, depth_scale);
        debug!(
            retained = frame.retained,
            rows = cloud.len(),
            "calibration frame"
        );

        let Some(transform) = transform_from_cloud(cloud.points()) else {
            // not enough of the reference surface in view; try the next frame
            continue;
        };

        if let Some(path) = &config.mask_snapshot {
            if let Err(e) = frame.mask_image().save(path) {
                warn!("failed to save the mask snapshot to {}: {e}", path.display());
            }
        }

        cloud.transform = transform;
        apply_manual_offset(&mut cloud);
        cloud.save_calibration(&config.calibration_path)?;
        info!(
            "calibration saved to {}",
            config.calibration_path.display()
        );
        return Ok(());
    }
}

/// Prompts once for an `x,y,z` nudge to subtract from the computed origin.
/// Unparseable input leaves the transform as computed.
fn apply_manual_offset(cloud: &mut PointCloud) {
    print!("Enter manual offset x,y,z: ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        warn!("could not read from stdin; no manual offset will be applied");
        return;
    }

    match parse_offset(&line) {
        Some(offset) => cloud.transform.origin -= offset,
        None => warn!("unable to parse input; no manual offset will be applied"),
    }
}
