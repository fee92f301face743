//! Batch extrinsic calibration over a rig directory.
//!
//! Layout consumed: `<rig_root>/chessboard/<camera>/*.json` correspondence
//! records, one per capture, plus the rig intrinsics file. Every camera is
//! processed independently with skip-on-failure; the run as a whole fails
//! only when no camera at all could be solved, or when the output artifact
//! cannot be written.

use crate::board::CorrespondenceRecord;
use crate::format::{ExtrinsicsStore, FormatError, IntrinsicsStore, MatrixYamlCodec};
use crate::pnp::{self, PoseRecord};
use log::{info, warn};
use nalgebra::Vector3;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(FormatError),
    #[error("Failed to write extrinsics: {0}")]
    Io(FormatError),
    #[error("Extrinsic calibration failed for all cameras")]
    Exhausted,
}

/// Per-camera success entry of a calibration run.
#[derive(Debug, Clone)]
pub struct SolvedCamera {
    pub name: String,
    pub reprojection_error: f64,
    pub camera_center: Vector3<f64>,
}

/// Per-camera skip entry, with a human-readable reason.
#[derive(Debug, Clone)]
pub struct SkippedCamera {
    pub name: String,
    pub reason: String,
}

/// Outcome of a calibration run. Partial success (some solved, some
/// skipped) is a success.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub solved: Vec<SolvedCamera>,
    pub skipped: Vec<SkippedCamera>,
    pub output_path: PathBuf,
}

/// Runs extrinsic calibration for every camera in the intrinsics file.
///
/// `capture_index` selects which correspondence record to use per camera,
/// counting the camera's record files in lexicographic path order. The
/// extrinsics file defaults to `<rig_root>/extri.yml`.
pub fn run(
    rig_root: &Path,
    intrinsics_path: &Path,
    capture_index: usize,
    output_path: Option<&Path>,
) -> Result<RunSummary, PipelineError> {
    let codec = MatrixYamlCodec;
    let intrinsics_store = IntrinsicsStore::new(codec.clone());
    let extrinsics_store = ExtrinsicsStore::new(codec);

    let cameras = intrinsics_store
        .load(intrinsics_path)
        .map_err(PipelineError::Config)?;
    let all_names: Vec<String> = cameras.keys().cloned().collect();

    let mut poses: BTreeMap<String, PoseRecord> = BTreeMap::new();
    let mut solved = Vec::new();
    let mut skipped = Vec::new();

    for (name, camera) in &cameras {
        match solve_camera(rig_root, name, camera, capture_index) {
            Ok(result) => {
                let center = result.pose.camera_center();
                info!(
                    "Camera '{name}': reprojection error = {:.3}px, camera center = [{:.4}, {:.4}, {:.4}]",
                    result.reprojection_error, center.x, center.y, center.z
                );
                solved.push(SolvedCamera {
                    name: name.clone(),
                    reprojection_error: result.reprojection_error,
                    camera_center: center,
                });
                poses.insert(name.clone(), result.pose);
            }
            Err(reason) => {
                warn!("Skipping camera '{name}': {reason}");
                skipped.push(SkippedCamera {
                    name: name.clone(),
                    reason,
                });
            }
        }
    }

    if poses.is_empty() {
        return Err(PipelineError::Exhausted);
    }

    let output_path = output_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| rig_root.join("extri.yml"));
    extrinsics_store
        .write(&output_path, &poses, &all_names)
        .map_err(PipelineError::Io)?;
    info!(
        "Extrinsic parameters written to {} ({} solved, {} skipped)",
        output_path.display(),
        solved.len(),
        skipped.len()
    );

    Ok(RunSummary {
        solved,
        skipped,
        output_path,
    })
}

/// Solves one camera; any failure becomes a skip reason, never fatal to
/// the other cameras.
fn solve_camera(
    rig_root: &Path,
    name: &str,
    camera: &crate::camera::CameraIntrinsics,
    capture_index: usize,
) -> Result<pnp::SolvedPose, String> {
    let capture_dir = rig_root.join("chessboard").join(name);
    let records = list_capture_records(&capture_dir);
    if records.is_empty() {
        return Err(format!(
            "no correspondence records found in '{}'",
            capture_dir.display()
        ));
    }
    if capture_index >= records.len() {
        return Err(format!(
            "capture index {capture_index} out of range ({} records available)",
            records.len()
        ));
    }

    let record_path = &records[capture_index];
    let record = CorrespondenceRecord::from_file(record_path)
        .map_err(|e| format!("could not parse '{}': {e}", record_path.display()))?;

    pnp::solve(&record, camera).map_err(|e| e.to_string())
}

/// The camera's capture records, in deterministic lexicographic path order.
fn list_capture_records(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut records: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    records.sort();
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{rodrigues_to_matrix, CameraIntrinsics};
    use nalgebra::Matrix3;
    use std::fmt::Write as _;

    fn write_intrinsics(path: &Path, names: &[&str]) {
        let mut doc = String::from("%YAML:1.0\n---\nnames:\n");
        for name in names {
            writeln!(doc, "  - \"{name}\"").unwrap();
        }
        for name in names {
            writeln!(doc, "K_{name}: !!opencv-matrix").unwrap();
            doc.push_str("  rows: 3\n  cols: 3\n  dt: d\n");
            doc.push_str("  data: [800.0, 0.0, 640.0, 0.0, 780.0, 360.0, 0.0, 0.0, 1.0]\n");
            writeln!(doc, "dist_{name}: !!opencv-matrix").unwrap();
            doc.push_str("  rows: 5\n  cols: 1\n  dt: d\n");
            doc.push_str("  data: [0.0, 0.0, 0.0, 0.0, 0.0]\n");
        }
        fs::write(path, doc).unwrap();
    }

    fn test_camera() -> CameraIntrinsics {
        let k = Matrix3::new(800.0, 0.0, 640.0, 0.0, 780.0, 360.0, 0.0, 0.0, 1.0);
        CameraIntrinsics::new(k, vec![0.0; 5]).unwrap()
    }

    /// A 3x2 planar grid with square side 0.1, projected through a
    /// per-camera ground-truth pose. Six valid points, comfortably above
    /// the four-point PnP minimum.
    fn write_capture(dir: &Path, file: &str, rx: f64, tz: f64) {
        let camera = test_camera();
        let rot = rodrigues_to_matrix(&[rx, -0.05, 0.1]);
        let t = Vector3::new(0.05, -0.1, tz);

        let mut keypoints3d = Vec::new();
        let mut keypoints2d = Vec::new();
        for i in 0..3usize {
            for j in 0..2usize {
                let pw = Vector3::new(i as f64 * 0.1, j as f64 * 0.1, 0.0);
                let pc = rot * pw + t;
                let pixel = camera.project(&pc).unwrap();
                keypoints3d.push([pw.x, pw.y, pw.z]);
                keypoints2d.push([pixel.x, pixel.y, 1.0]);
            }
        }
        let record = CorrespondenceRecord {
            keypoints3d,
            keypoints2d,
            pattern: [2, 3],
            grid_size: 0.1,
            visited: true,
        };
        fs::create_dir_all(dir).unwrap();
        record.to_file(&dir.join(file)).unwrap();
    }

    #[test]
    fn test_run_solves_all_cameras_end_to_end() {
        let rig = tempfile::tempdir().unwrap();
        let intri = rig.path().join("intri.yml");
        write_intrinsics(&intri, &["camA", "camB"]);
        write_capture(&rig.path().join("chessboard/camA"), "000000.json", 0.1, 1.2);
        write_capture(&rig.path().join("chessboard/camB"), "000000.json", -0.2, 1.5);

        let summary = run(rig.path(), &intri, 0, None).unwrap();
        assert_eq!(summary.solved.len(), 2);
        assert!(summary.skipped.is_empty());
        assert!(summary.solved.iter().all(|s| s.reprojection_error < 1.0));

        let poses = ExtrinsicsStore::default()
            .read(&summary.output_path)
            .unwrap();
        assert_eq!(poses.len(), 2);
        assert!(poses.contains_key("camA") && poses.contains_key("camB"));

        let text = fs::read_to_string(&summary.output_path).unwrap();
        for key in ["R_camA", "Rot_camA", "T_camA", "R_camB", "Rot_camB", "T_camB"] {
            assert!(text.contains(key), "missing block {key}");
        }
    }

    #[test]
    fn test_run_skips_camera_with_empty_capture_dir() {
        let rig = tempfile::tempdir().unwrap();
        let intri = rig.path().join("intri.yml");
        write_intrinsics(&intri, &["camA", "camB"]);
        write_capture(&rig.path().join("chessboard/camA"), "000000.json", 0.1, 1.2);
        fs::create_dir_all(rig.path().join("chessboard/camB")).unwrap();

        let summary = run(rig.path(), &intri, 0, None).unwrap();
        assert_eq!(summary.solved.len(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].name, "camB");

        // The names list still carries the full rig; camB has no blocks.
        let text = fs::read_to_string(&summary.output_path).unwrap();
        assert!(text.contains("- \"camB\""));
        assert!(!text.contains("Rot_camB"));
    }

    #[test]
    fn test_run_selects_capture_by_lexicographic_index() {
        let rig = tempfile::tempdir().unwrap();
        let intri = rig.path().join("intri.yml");
        write_intrinsics(&intri, &["camA"]);
        let dir = rig.path().join("chessboard/camA");
        write_capture(&dir, "000001.json", 0.3, 2.0);
        write_capture(&dir, "000000.json", 0.1, 1.2);

        let summary = run(rig.path(), &intri, 1, None).unwrap();
        assert_eq!(summary.solved.len(), 1);

        // Index 1 must pick 000001.json (tz = 2.0) despite creation order.
        let poses = ExtrinsicsStore::default()
            .read(&summary.output_path)
            .unwrap();
        assert!((poses["camA"].t.z - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_run_skips_camera_with_unparseable_record() {
        let rig = tempfile::tempdir().unwrap();
        let intri = rig.path().join("intri.yml");
        write_intrinsics(&intri, &["camA", "camB", "camC"]);
        write_capture(&rig.path().join("chessboard/camA"), "000000.json", 0.1, 1.2);
        let bad_dir = rig.path().join("chessboard/camB");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join("000000.json"), "not json").unwrap();
        write_capture(&rig.path().join("chessboard/camC"), "000000.json", 0.2, 1.4);

        let summary = run(rig.path(), &intri, 0, None).unwrap();
        assert_eq!(summary.solved.len(), 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].name, "camB");
        assert!(summary.skipped[0].reason.contains("could not parse"));
    }

    #[test]
    fn test_run_skips_capture_index_out_of_range() {
        let rig = tempfile::tempdir().unwrap();
        let intri = rig.path().join("intri.yml");
        write_intrinsics(&intri, &["camA", "camB"]);
        write_capture(&rig.path().join("chessboard/camA"), "000000.json", 0.1, 1.2);
        write_capture(&rig.path().join("chessboard/camA"), "000001.json", 0.2, 1.4);
        write_capture(&rig.path().join("chessboard/camB"), "000000.json", 0.1, 1.3);

        let summary = run(rig.path(), &intri, 1, None).unwrap();
        assert_eq!(summary.solved.len(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].name, "camB");
        assert!(summary.skipped[0].reason.contains("out of range"));
    }

    #[test]
    fn test_run_fails_when_no_camera_solves() {
        let rig = tempfile::tempdir().unwrap();
        let intri = rig.path().join("intri.yml");
        write_intrinsics(&intri, &["camA"]);

        let output = rig.path().join("extri.yml");
        let result = run(rig.path(), &intri, 0, Some(&output));
        assert!(matches!(result, Err(PipelineError::Exhausted)));
        assert!(!output.exists());
    }
}
