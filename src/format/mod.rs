//! The OpenCV-style YAML interchange format used by the rig.
//!
//! Intrinsics and extrinsics files share the same conventions: a `%YAML:1.0`
//! header line that standard parsers reject and must be skipped, a `names`
//! sequence listing the rig cameras, and per-camera matrix blocks tagged
//! `!!opencv-matrix` carrying `{rows, cols, dt, data}`. The tag is treated
//! transparently as a plain mapping in both directions; all quirks live in
//! [`MatrixYamlCodec`] so the rest of the pipeline only sees shaped matrices.

use crate::camera::{matrix_to_rodrigues, CameraIntrinsics};
use crate::pnp::PoseRecord;
use log::warn;
use nalgebra::{DMatrix, Matrix3, Vector3};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use yaml_rust::{Yaml, YamlLoader};

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] yaml_rust::ScanError),
    #[error("YAML document is empty")]
    EmptyDocument,
    #[error("Missing key '{0}'")]
    MissingKey(String),
    #[error("Matrix '{key}' declares {rows}x{cols} but carries {len} values")]
    ShapeMismatch {
        key: String,
        rows: usize,
        cols: usize,
        len: usize,
    },
    #[error("Matrix '{key}' has a non-numeric data entry")]
    BadElement { key: String },
    #[error("Invalid intrinsics for camera '{name}': {source}")]
    InvalidCamera {
        name: String,
        source: crate::camera::CameraError,
    },
    #[error("No camera could be loaded from '{0}'")]
    NoCameras(String),
}

/// Codec for the matrix-tagged YAML dialect.
///
/// Constructed explicitly and handed to the stores; holds the header-skip and
/// tag-transparency behavior with no process-global registration.
#[derive(Debug, Clone, Default)]
pub struct MatrixYamlCodec;

impl MatrixYamlCodec {
    /// Parses a document, skipping the non-standard `%YAML` header line.
    pub fn parse(&self, contents: &str) -> Result<Yaml, FormatError> {
        let body = match contents.lines().next() {
            Some(first) if first.starts_with("%YAML") => contents
                .split_once('\n')
                .map(|(_, rest)| rest)
                .unwrap_or(""),
            _ => contents,
        };
        let mut docs = YamlLoader::load_from_str(body)?;
        if docs.is_empty() {
            return Err(FormatError::EmptyDocument);
        }
        Ok(docs.remove(0))
    }

    /// Reads the top-level `names` sequence.
    pub fn names(&self, doc: &Yaml) -> Result<Vec<String>, FormatError> {
        let seq = doc["names"]
            .as_vec()
            .ok_or_else(|| FormatError::MissingKey("names".to_string()))?;
        Ok(seq
            .iter()
            .filter_map(|n| n.as_str().map(str::to_string))
            .collect())
    }

    /// Extracts a `{rows, cols, data}` block and reshapes the flat data array.
    pub fn matrix(&self, doc: &Yaml, key: &str) -> Result<DMatrix<f64>, FormatError> {
        let node = &doc[key];
        let rows = node["rows"]
            .as_i64()
            .ok_or_else(|| FormatError::MissingKey(format!("{key}.rows")))? as usize;
        let cols = node["cols"]
            .as_i64()
            .ok_or_else(|| FormatError::MissingKey(format!("{key}.cols")))? as usize;
        let data = node["data"]
            .as_vec()
            .ok_or_else(|| FormatError::MissingKey(format!("{key}.data")))?;

        if data.len() != rows * cols {
            return Err(FormatError::ShapeMismatch {
                key: key.to_string(),
                rows,
                cols,
                len: data.len(),
            });
        }

        let mut values = Vec::with_capacity(data.len());
        for item in data {
            let v = item
                .as_f64()
                .or_else(|| item.as_i64().map(|i| i as f64))
                .ok_or_else(|| FormatError::BadElement {
                    key: key.to_string(),
                })?;
            values.push(v);
        }
        // OpenCV flattens row by row.
        Ok(DMatrix::from_row_slice(rows, cols, &values))
    }

    /// Writes one tagged matrix block, data formatted at 6 decimal digits.
    pub fn write_matrix<W: Write>(
        &self,
        writer: &mut W,
        key: &str,
        matrix: &DMatrix<f64>,
    ) -> Result<(), FormatError> {
        writeln!(writer, "{key}: !!opencv-matrix")?;
        writeln!(writer, "  rows: {}", matrix.nrows())?;
        writeln!(writer, "  cols: {}", matrix.ncols())?;
        writeln!(writer, "  dt: d")?;
        let data: Vec<String> = matrix
            .row_iter()
            .flat_map(|row| {
                row.iter()
                    .map(|x| format!("{x:.6}"))
                    .collect::<Vec<_>>()
            })
            .collect();
        writeln!(writer, "  data: [{}]", data.join(", "))?;
        Ok(())
    }

    /// Writes the document header and the quoted `names` sequence.
    pub fn write_header<W: Write>(
        &self,
        writer: &mut W,
        names: &[String],
    ) -> Result<(), FormatError> {
        write!(writer, "%YAML:1.0\n---\n")?;
        writeln!(writer, "names:")?;
        for name in names {
            writeln!(writer, "  - \"{name}\"")?;
        }
        Ok(())
    }
}

/// Loader for the per-rig intrinsics file (`K_<cam>` / `dist_<cam>` blocks).
#[derive(Debug, Clone, Default)]
pub struct IntrinsicsStore {
    codec: MatrixYamlCodec,
}

impl IntrinsicsStore {
    pub fn new(codec: MatrixYamlCodec) -> Self {
        IntrinsicsStore { codec }
    }

    /// Loads every camera it can; cameras with missing or malformed blocks
    /// are logged and excluded rather than failing the whole file.
    pub fn load(&self, path: &Path) -> Result<BTreeMap<String, CameraIntrinsics>, FormatError> {
        let contents = fs::read_to_string(path)?;
        let doc = self.codec.parse(&contents)?;
        let names = self.codec.names(&doc)?;

        let mut cameras = BTreeMap::new();
        for name in names {
            match self.load_camera(&doc, &name) {
                Ok(cam) => {
                    cameras.insert(name, cam);
                }
                Err(e) => {
                    warn!("Skipping camera '{name}' in {}: {e}", path.display());
                }
            }
        }

        if cameras.is_empty() {
            return Err(FormatError::NoCameras(path.display().to_string()));
        }
        Ok(cameras)
    }

    fn load_camera(&self, doc: &Yaml, name: &str) -> Result<CameraIntrinsics, FormatError> {
        let k = self.codec.matrix(doc, &format!("K_{name}"))?;
        let dist = self.codec.matrix(doc, &format!("dist_{name}"))?;

        if k.nrows() != 3 || k.ncols() != 3 {
            return Err(FormatError::ShapeMismatch {
                key: format!("K_{name}"),
                rows: 3,
                cols: 3,
                len: k.len(),
            });
        }
        // dist is a row or column vector, never a full matrix.
        if dist.nrows() != 1 && dist.ncols() != 1 {
            return Err(FormatError::ShapeMismatch {
                key: format!("dist_{name}"),
                rows: dist.nrows(),
                cols: dist.ncols(),
                len: dist.len(),
            });
        }

        let k = Matrix3::from_fn(|r, c| k[(r, c)]);
        let dist: Vec<f64> = dist.iter().copied().collect();
        CameraIntrinsics::new(k, dist).map_err(|e| FormatError::InvalidCamera {
            name: name.to_string(),
            source: e,
        })
    }
}

/// Writer/reader for the solved extrinsics file.
#[derive(Debug, Clone, Default)]
pub struct ExtrinsicsStore {
    codec: MatrixYamlCodec,
}

impl ExtrinsicsStore {
    pub fn new(codec: MatrixYamlCodec) -> Self {
        ExtrinsicsStore { codec }
    }

    /// Writes the solved poses. `all_names` lists the full rig, including
    /// cameras that failed solving, so downstream consumers can detect the
    /// missing ones by absence of their matrix blocks.
    pub fn write(
        &self,
        path: &Path,
        poses: &BTreeMap<String, PoseRecord>,
        all_names: &[String],
    ) -> Result<(), FormatError> {
        let mut file = fs::File::create(path)?;
        self.codec.write_header(&mut file, all_names)?;

        // BTreeMap iteration gives sorted-name order for determinism.
        for (name, pose) in poses {
            let rvec = DMatrix::from_column_slice(3, 1, pose.rvec.as_slice());
            let rot = DMatrix::from_fn(3, 3, |r, c| pose.rot[(r, c)]);
            let tvec = DMatrix::from_column_slice(3, 1, pose.t.as_slice());
            self.codec.write_matrix(&mut file, &format!("R_{name}"), &rvec)?;
            self.codec.write_matrix(&mut file, &format!("Rot_{name}"), &rot)?;
            self.codec.write_matrix(&mut file, &format!("T_{name}"), &tvec)?;
        }
        Ok(())
    }

    /// Reads poses back; cameras listed in `names` but missing their matrix
    /// blocks are simply absent from the returned map.
    pub fn read(&self, path: &Path) -> Result<BTreeMap<String, PoseRecord>, FormatError> {
        let contents = fs::read_to_string(path)?;
        let doc = self.codec.parse(&contents)?;
        let names = self.codec.names(&doc)?;

        let mut poses = BTreeMap::new();
        for name in names {
            let rot = match self.codec.matrix(&doc, &format!("Rot_{name}")) {
                Ok(m) => m,
                Err(FormatError::MissingKey(_)) => continue,
                Err(e) => return Err(e),
            };
            let tvec = self.codec.matrix(&doc, &format!("T_{name}"))?;
            if rot.nrows() != 3 || rot.ncols() != 3 || tvec.len() != 3 {
                return Err(FormatError::ShapeMismatch {
                    key: format!("Rot_{name}/T_{name}"),
                    rows: rot.nrows(),
                    cols: rot.ncols(),
                    len: tvec.len(),
                });
            }
            let rot = Matrix3::from_fn(|r, c| rot[(r, c)]);
            let t = Vector3::new(tvec[0], tvec[1], tvec[2]);
            // Rvec is present in files we write, but Rot is authoritative.
            let rvec = match self.codec.matrix(&doc, &format!("R_{name}")) {
                Ok(m) if m.len() == 3 => Vector3::new(m[0], m[1], m[2]),
                _ => matrix_to_rodrigues(&rot),
            };
            poses.insert(name, PoseRecord { rvec, rot, t });
        }
        Ok(poses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::rodrigues_to_matrix;
    use approx::assert_relative_eq;

    const SAMPLE_INTRINSICS: &str = "%YAML:1.0\n---\nnames:\n  - \"camA\"\n  - \"camB\"\nK_camA: !!opencv-matrix\n  rows: 3\n  cols: 3\n  dt: d\n  data: [500.0, 0.0, 320.0, 0.0, 510.0, 240.0, 0.0, 0.0, 1.0]\ndist_camA: !!opencv-matrix\n  rows: 5\n  cols: 1\n  dt: d\n  data: [-0.28, 0.07, 0.0002, 0.00002, 0.0]\nK_camB: !!opencv-matrix\n  rows: 3\n  cols: 3\n  dt: d\n  data: [600.0, 0.0, 400.0, 0.0, 600.0, 300.0, 0.0, 0.0, 1.0]\ndist_camB: !!opencv-matrix\n  rows: 1\n  cols: 4\n  dt: d\n  data: [0.1, -0.05, 0.001, 0.001]\n";

    #[test]
    fn test_parse_skips_header_and_matrix_tag() {
        let codec = MatrixYamlCodec;
        let doc = codec.parse(SAMPLE_INTRINSICS).unwrap();
        assert_eq!(codec.names(&doc).unwrap(), vec!["camA", "camB"]);

        let k = codec.matrix(&doc, "K_camA").unwrap();
        assert_eq!((k.nrows(), k.ncols()), (3, 3));
        assert_relative_eq!(k[(0, 0)], 500.0);
        assert_relative_eq!(k[(1, 2)], 240.0);
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let codec = MatrixYamlCodec;
        let doc = codec
            .parse("bad: !!opencv-matrix\n  rows: 3\n  cols: 3\n  dt: d\n  data: [1.0, 2.0]\n")
            .unwrap();
        assert!(matches!(
            codec.matrix(&doc, "bad"),
            Err(FormatError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_intrinsics_load_accepts_row_and_column_dist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intri.yml");
        fs::write(&path, SAMPLE_INTRINSICS).unwrap();

        let store = IntrinsicsStore::default();
        let cameras = store.load(&path).unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras["camA"].dist.len(), 5);
        assert_eq!(cameras["camB"].dist.len(), 4);
        assert_relative_eq!(cameras["camB"].fx(), 600.0);
    }

    #[test]
    fn test_intrinsics_load_skips_camera_with_missing_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intri.yml");
        let doc = "%YAML:1.0\nnames:\n  - \"camA\"\n  - \"ghost\"\nK_camA: !!opencv-matrix\n  rows: 3\n  cols: 3\n  dt: d\n  data: [500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0]\ndist_camA: !!opencv-matrix\n  rows: 4\n  cols: 1\n  dt: d\n  data: [0.0, 0.0, 0.0, 0.0]\n";
        fs::write(&path, doc).unwrap();

        let cameras = IntrinsicsStore::default().load(&path).unwrap();
        assert_eq!(cameras.len(), 1);
        assert!(cameras.contains_key("camA"));
    }

    #[test]
    fn test_intrinsics_missing_file_is_an_error() {
        let store = IntrinsicsStore::default();
        assert!(matches!(
            store.load(Path::new("/nonexistent/intri.yml")),
            Err(FormatError::Io(_))
        ));
    }

    #[test]
    fn test_extrinsics_round_trip_to_six_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extri.yml");

        let rvec = Vector3::new(0.123456789, -0.2, 0.05);
        let rot = rodrigues_to_matrix(&[rvec.x, rvec.y, rvec.z]);
        let t = Vector3::new(0.1, -0.25, 1.5);
        let mut poses = BTreeMap::new();
        poses.insert("camA".to_string(), PoseRecord { rvec, rot, t });

        let all_names = vec!["camA".to_string(), "camB".to_string()];
        let store = ExtrinsicsStore::default();
        store.write(&path, &poses, &all_names).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("%YAML:1.0\n---\n"));
        assert!(text.contains("- \"camB\""));
        assert!(text.contains("Rot_camA: !!opencv-matrix"));
        // camB failed solving: listed in names, no matrix blocks.
        assert!(!text.contains("Rot_camB"));

        let loaded = store.read(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        let pose = &loaded["camA"];
        assert_relative_eq!(pose.rvec.x, 0.123457, epsilon = 1e-6);
        assert_relative_eq!(pose.t.z, 1.5, epsilon = 1e-6);
        for r in 0..3 {
            for c in 0..3 {
                assert_relative_eq!(pose.rot[(r, c)], rot[(r, c)], epsilon = 1e-6);
            }
        }
    }
}
