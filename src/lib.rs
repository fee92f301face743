//! Multiview Calibration Library
//!
//! Extrinsic calibration support for synchronized multi-camera capture rigs.
//! This library provides the file-based calibration core:
//! - OpenCV-style YAML interchange for intrinsics and extrinsics
//! - Checkerboard corner detection with subpixel refinement
//! - Perspective-n-point pose solving with reprojection-error diagnostics
//! - A per-camera batch orchestrator with skip-on-failure semantics
//! - Wireframe-cube projection for visual verification of solved poses
//!
//! Device enumeration, recording and preview UIs are external collaborators;
//! the core consumes intrinsics and correspondence files and produces an
//! extrinsics artifact.

pub mod board;
pub mod camera;
pub mod format;
pub mod pipeline;
pub mod pnp;
pub mod render;

// Re-export commonly used types
pub use board::{CorrespondenceRecord, DetectError};
pub use camera::{CameraError, CameraIntrinsics};
pub use format::{ExtrinsicsStore, FormatError, IntrinsicsStore, MatrixYamlCodec};
pub use pipeline::{PipelineError, RunSummary};
pub use pnp::{PoseError, PoseRecord, SolvedPose};
pub use render::RenderError;
