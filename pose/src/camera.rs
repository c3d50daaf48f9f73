//! Depth-source ownership. The RealSense implementation is compiled in with
//! the `realsense` feature; without it, enumeration reports no devices and
//! startup aborts, which keeps the pipeline and its tests free of the native
//! dependency.

use anyhow::bail;
use brachial::DepthSource;

#[cfg(feature = "realsense")]
pub use realsense::RealSenseSource;

/// Opens the first connected depth camera and starts its depth stream.
pub fn open_default_source() -> anyhow::Result<Box<dyn DepthSource>> {
    #[cfg(feature = "realsense")]
    {
        let count = realsense::count_devices()?;
        if count == 0 {
            bail!("no RealSense devices are connected to the system at this time");
        }
        Ok(Box::new(RealSenseSource::open(0)?))
    }
    #[cfg(not(feature = "realsense"))]
    {
        bail!("no depth source available: this build has no camera backend (enable the `realsense` feature)");
    }
}

#[cfg(feature = "realsense")]
mod realsense {
    use std::collections::HashSet;
    use std::time::Duration;

    use anyhow::{anyhow, Context};
    use brachial::{DepthIntrinsics, DepthSource};
    use realsense_rust::config::Config;
    use realsense_rust::context::Context as RsContext;
    use realsense_rust::frame::{DepthFrame, PixelKind};
    use realsense_rust::kind::{Rs2Format, Rs2StreamKind};
    use realsense_rust::pipeline::ActivePipeline;
    use tracing::{info, warn};

    pub fn count_devices() -> anyhow::Result<usize> {
        let context = RsContext::new().context("failed to create RealSense context")?;
        Ok(context.query_devices(HashSet::new()).len())
    }

    pub struct RealSenseSource {
        pipeline: ActivePipeline,
        intrinsics: DepthIntrinsics,
        depth_scale: f32,
        frame: Vec<u16>,
    }

    impl RealSenseSource {
        /// Connects to the device at `index` and enables its depth stream at
        /// the device-preferred configuration.
        pub fn open(index: usize) -> anyhow::Result<Self> {
            let context = RsContext::new().context("failed to create RealSense context")?;
            if context.query_devices(HashSet::new()).len() <= index {
                return Err(anyhow!("no RealSense device at index {index}"));
            }

            let mut config = Config::new();
            config
                .disable_all_streams()
                .map_err(|e| anyhow!("failed to disable streams: {e}"))?
                .enable_stream(Rs2StreamKind::Depth, None, 0, 0, Rs2Format::Z16, 0)
                .map_err(|e| anyhow!("failed to enable the depth stream: {e}"))?;

            let pipeline = realsense_rust::pipeline::InactivePipeline::try_from(&context)
                .map_err(|e| anyhow!("failed to open a RealSense pipeline: {e}"))?;
            let mut pipeline = pipeline
                .start(Some(config))
                .map_err(|e| anyhow!("failed to start the depth stream: {e}"))?;

            let (intrinsics, depth_scale) = Self::stream_parameters(&mut pipeline)?;
            info!(
                width = intrinsics.width,
                height = intrinsics.height,
                depth_scale,
                "depth stream opened"
            );
            Ok(Self {
                pipeline,
                intrinsics,
                depth_scale,
                frame: Vec::new(),
            })
        }

        fn stream_parameters(
            pipeline: &mut ActivePipeline,
        ) -> anyhow::Result<(DepthIntrinsics, f32)> {
            let mut result = None;
            for stream in pipeline.profile().streams() {
                if stream.format() != Rs2Format::Z16 {
                    continue;
                }
                let intrinsics = stream
                    .intrinsics()
                    .map_err(|e| anyhow!("failed to read depth intrinsics: {e}"))?;
                result = Some(DepthIntrinsics {
                    fx: intrinsics.fx(),
                    fy: intrinsics.fy(),
                    cx: intrinsics.ppx(),
                    cy: intrinsics.ppy(),
                    width: intrinsics.width() as u32,
                    height: intrinsics.height() as u32,
                });
            }
            let intrinsics = result.ok_or_else(|| anyhow!("depth stream has no intrinsics"))?;

            // the depth scale is a frame property; grab one frame to read it
            let frames = pipeline
                .wait(Some(Duration::from_millis(5000)))
                .map_err(|e| anyhow!("failed to read the first depth frame: {e}"))?;
            let frame = frames
                .frames_of_type::<DepthFrame>()
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("first frame set held no depth frame"))?;
            let depth_scale = frame
                .depth_units()
                .map_err(|e| anyhow!("failed to read the depth scale: {e}"))?;
            Ok((intrinsics, depth_scale))
        }
    }

    impl DepthSource for RealSenseSource {
        fn intrinsics(&self) -> DepthIntrinsics {
            self.intrinsics
        }

        fn depth_scale(&self) -> f32 {
            self.depth_scale
        }

        fn wait_for_frame(
            &mut self,
        ) -> Result<&[u16], Box<dyn std::error::Error + Send + Sync>> {
            loop {
                let frames = self.pipeline.wait(Some(Duration::from_millis(1000)))?;
                let Some(frame) = frames.frames_of_type::<DepthFrame>().into_iter().next()
                else {
                    continue;
                };
                if !matches!(frame.get(0, 0), Some(PixelKind::Z16 { .. })) {
                    warn!("unexpected depth pixel kind: {:?}", frame.get(0, 0));
                    continue;
                }
                debug_assert_eq!(frame.bits_per_pixel(), 16);
                let pixels = frame.width() * frame.height();
                self.frame.clear();
                self.frame.reserve(pixels);
                unsafe {
                    let data: *const _ = frame.get_data();
                    self.frame
                        .extend_from_slice(std::slice::from_raw_parts(data.cast::<u16>(), pixels));
                }
                return Ok(&self.frame);
            }
        }
    }
}
