//! This crate implements the per-frame vision pipeline that turns raw depth
//! frames into stable upper-body joint locations: foreground segmentation,
//! deprojection into a metric point cloud, rigid self-calibration against a
//! flat reference object, k-means summarization with a proximity graph over
//! the cluster centers, and graph-walking arm tracing with temporal smoothing.
//!
//! The pipeline is single-threaded per camera; multiple cameras are supported
//! by instantiating independent pipelines with no shared state.

pub mod arm;
pub mod calibfile;
pub mod calibrate;
pub mod cloud;
pub mod cluster;
pub mod kmeans;
pub mod segment;
pub mod source;

pub use arm::Arm;
pub use cloud::{CalibrationTransform, PointCloud};
pub use cluster::Clusterer;
pub use segment::{FrameSegmenter, SegmentedFrame};
pub use source::{DepthIntrinsics, DepthSource};
