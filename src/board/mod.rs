//! Checkerboard corner detection and the per-capture correspondence record.
//!
//! Inner corners are found as saddle points of the smoothed intensity
//! (`Ixy^2 - Ixx*Iyy` is strongly positive at an X-junction), filtered by a
//! ring test that rejects edge and L-junction responses, ordered into the
//! requested `W x H` lattice and refined to subpixel accuracy with the
//! classic gradient-orthogonality iteration (window radius 11, at most 30
//! iterations, stopping early once the update drops below 0.001 px).
//!
//! Every detected corner carries its `(i, j)` lattice index, and the matching
//! 3D object point `(i * grid_size, j * grid_size, 0)` is synthesized from
//! the same index pair, so the 2D/3D correspondence never depends on two
//! loops agreeing by convention.

use image::GrayImage;
use log::debug;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error("Checkerboard not found: expected {expected} corners, found {found} candidates")]
    BoardNotFound { expected: usize, found: usize },
    #[error("Pattern size must have at least 2x2 inner corners, got {0}x{1}")]
    PatternTooSmall(u32, u32),
    #[error("Grid size must be positive, got {0}")]
    BadGridSize(f64),
    #[error("Failed to read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse correspondence record: {0}")]
    Json(#[from] serde_json::Error),
}

/// One capture's 2D/3D correspondences, in the rig's JSON interchange layout.
///
/// `keypoints3d` and `keypoints2d` have equal length with implicit index
/// correspondence; the third column of `keypoints2d` is a validity marker and
/// only rows where it is positive participate in pose solving. `pattern`
/// stores `[H, W]` (axes swapped relative to the detector input, matching the
/// on-disk convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrespondenceRecord {
    pub keypoints3d: Vec<[f64; 3]>,
    pub keypoints2d: Vec<[f64; 3]>,
    pub pattern: [u32; 2],
    pub grid_size: f64,
    pub visited: bool,
}

impl CorrespondenceRecord {
    pub fn from_file(path: &Path) -> Result<Self, DetectError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), DetectError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Detects a `(w, h)` inner-corner checkerboard in a grayscale image.
///
/// `w` counts corners along the image x axis, `h` along y; `grid_size` is the
/// physical edge length of one square and fixes the unit of the synthesized
/// object points.
pub fn detect(
    image: &GrayImage,
    pattern_size: (u32, u32),
    grid_size: f64,
) -> Result<CorrespondenceRecord, DetectError> {
    let (w, h) = pattern_size;
    if w < 2 || h < 2 {
        return Err(DetectError::PatternTooSmall(w, h));
    }
    if grid_size <= 0.0 {
        return Err(DetectError::BadGridSize(grid_size));
    }
    let expected = (w * h) as usize;

    let gray = FloatImage::from_gray(image);
    let smoothed = gray.gaussian_blur(1.5);

    let mut candidates = saddle_candidates(&smoothed);
    candidates.retain(|c| is_x_junction(&smoothed, c.position));
    debug!(
        "checkerboard: {} saddle candidates after ring filter",
        candidates.len()
    );

    if candidates.len() < expected {
        return Err(DetectError::BoardNotFound {
            expected,
            found: candidates.len(),
        });
    }
    candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
    candidates.truncate(expected);

    let lattice = order_lattice(
        &candidates.iter().map(|c| c.position).collect::<Vec<_>>(),
        w as usize,
        h as usize,
    )
    .ok_or(DetectError::BoardNotFound {
        expected,
        found: candidates.len(),
    })?;

    // Refine on the unsmoothed intensity and emit 2D/3D rows from the shared
    // lattice index, outer loop over the W axis as the interchange format
    // prescribes.
    let mut keypoints3d = Vec::with_capacity(expected);
    let mut keypoints2d = Vec::with_capacity(expected);
    for i in 0..w as usize {
        for j in 0..h as usize {
            let corner = lattice[j * w as usize + i];
            let refined = refine_subpixel(&gray, corner);
            keypoints3d.push([i as f64 * grid_size, j as f64 * grid_size, 0.0]);
            keypoints2d.push([refined.x, refined.y, 1.0]);
        }
    }

    Ok(CorrespondenceRecord {
        keypoints3d,
        keypoints2d,
        pattern: [h, w],
        grid_size,
        visited: true,
    })
}

/// Dense single-channel float image with clamped bilinear access.
struct FloatImage {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl FloatImage {
    fn from_gray(image: &GrayImage) -> Self {
        FloatImage {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.pixels().map(|p| p.0[0] as f32).collect(),
        }
    }

    fn at(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.data[y * self.width + x]
    }

    fn bilinear(&self, x: f64, y: f64) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let (xi, yi) = (x0 as i64, y0 as i64);
        let top = self.at(xi, yi) * (1.0 - fx) + self.at(xi + 1, yi) * fx;
        let bottom = self.at(xi, yi + 1) * (1.0 - fx) + self.at(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn gaussian_blur(&self, sigma: f32) -> FloatImage {
        let radius = (3.0 * sigma).ceil() as i64;
        let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
        for d in -radius..=radius {
            kernel.push((-(d * d) as f32 / (2.0 * sigma * sigma)).exp());
        }
        let sum: f32 = kernel.iter().sum();
        for k in &mut kernel {
            *k /= sum;
        }

        let mut horizontal = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (ki, d) in (-radius..=radius).enumerate() {
                    acc += kernel[ki] * self.at(x as i64 + d, y as i64);
                }
                horizontal[y * self.width + x] = acc;
            }
        }
        let blurred = FloatImage {
            width: self.width,
            height: self.height,
            data: horizontal,
        };

        let mut vertical = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (ki, d) in (-radius..=radius).enumerate() {
                    acc += kernel[ki] * blurred.at(x as i64, y as i64 + d);
                }
                vertical[y * self.width + x] = acc;
            }
        }
        FloatImage {
            width: self.width,
            height: self.height,
            data: vertical,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    position: Vector2<f64>,
    response: f64,
}

/// Saddle-point response `Ixy^2 - Ixx*Iyy` with non-maximum suppression.
fn saddle_candidates(image: &FloatImage) -> Vec<Candidate> {
    const STEP: i64 = 2;
    const NMS_RADIUS: i64 = 5;

    let mut response = vec![0.0f32; image.data.len()];
    let mut max_response = 0.0f32;
    for y in STEP..image.height as i64 - STEP {
        for x in STEP..image.width as i64 - STEP {
            let ixx = image.at(x + STEP, y) - 2.0 * image.at(x, y) + image.at(x - STEP, y);
            let iyy = image.at(x, y + STEP) - 2.0 * image.at(x, y) + image.at(x, y - STEP);
            let ixy = (image.at(x + STEP, y + STEP) - image.at(x - STEP, y + STEP)
                - image.at(x + STEP, y - STEP)
                + image.at(x - STEP, y - STEP))
                / 4.0;
            let r = ixy * ixy - ixx * iyy;
            response[y as usize * image.width + x as usize] = r;
            if r > max_response {
                max_response = r;
            }
        }
    }
    if max_response <= 0.0 {
        return Vec::new();
    }

    let threshold = 0.1 * max_response;
    let mut candidates = Vec::new();
    for y in NMS_RADIUS..image.height as i64 - NMS_RADIUS {
        'pixel: for x in NMS_RADIUS..image.width as i64 - NMS_RADIUS {
            let r = response[y as usize * image.width + x as usize];
            if r < threshold {
                continue;
            }
            for dy in -NMS_RADIUS..=NMS_RADIUS {
                for dx in -NMS_RADIUS..=NMS_RADIUS {
                    let other = response[(y + dy) as usize * image.width + (x + dx) as usize];
                    if other > r {
                        continue 'pixel;
                    }
                    // Ties resolve to the raster-first pixel.
                    if other == r && (dy < 0 || (dy == 0 && dx < 0)) {
                        continue 'pixel;
                    }
                }
            }
            candidates.push(Candidate {
                position: Vector2::new(x as f64, y as f64),
                response: r as f64,
            });
        }
    }
    candidates
}

/// Ring test distinguishing X-junctions from edges and L-junctions.
///
/// Samples 16 points on a radius-5 circle: at a checkerboard corner the ring
/// is point-symmetric (opposite samples match) while adjacent quadrants
/// alternate, so the quadrature contrast dominates the symmetry error.
fn is_x_junction(image: &FloatImage, center: Vector2<f64>) -> bool {
    const RADIUS: f64 = 5.0;
    const SAMPLES: usize = 16;

    let mut ring = [0.0f64; SAMPLES];
    for (n, value) in ring.iter_mut().enumerate() {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / SAMPLES as f64;
        *value = image.bilinear(
            center.x + RADIUS * angle.cos(),
            center.y + RADIUS * angle.sin(),
        ) as f64;
    }

    let mut symmetry_error = 0.0;
    let mut contrast = 0.0;
    for n in 0..SAMPLES / 2 {
        symmetry_error += (ring[n] - ring[n + SAMPLES / 2]).abs();
        contrast += (ring[n] - ring[(n + SAMPLES / 4) % SAMPLES]).abs();
    }
    contrast > 2.0 * symmetry_error && contrast > 8.0
}

/// Orders `w * h` corner candidates into a row-major lattice
/// (`h` rows of `w` corners, top-left first).
///
/// The board orientation is estimated from nearest-neighbour directions
/// folded modulo 90 degrees, the cloud is de-rotated, and rows are split by
/// sorted y. Handles rotated and mildly perspective boards; the near-45
/// degree ambiguity inherent to a square lattice resolves to whichever axis
/// the fold picks, which is consistent between the 2D and 3D emissions.
fn order_lattice(points: &[Vector2<f64>], w: usize, h: usize) -> Option<Vec<Vector2<f64>>> {
    if points.len() != w * h {
        return None;
    }

    // Fold each nearest-neighbour direction into [0, 90) degrees via angle
    // quadrupling, then average on the unit circle.
    let mut sin_sum = 0.0;
    let mut cos_sum = 0.0;
    for (idx, p) in points.iter().enumerate() {
        let mut best = f64::MAX;
        let mut dir = Vector2::zeros();
        for (jdx, q) in points.iter().enumerate() {
            if idx == jdx {
                continue;
            }
            let d = q - p;
            let dist = d.norm();
            if dist < best {
                best = dist;
                dir = d;
            }
        }
        let angle = 4.0 * dir.y.atan2(dir.x);
        sin_sum += angle.sin();
        cos_sum += angle.cos();
    }
    let theta = sin_sum.atan2(cos_sum) / 4.0;

    let (sin_t, cos_t) = (-theta).sin_cos();
    let mut rotated: Vec<(usize, Vector2<f64>)> = points
        .iter()
        .enumerate()
        .map(|(idx, p)| {
            (
                idx,
                Vector2::new(cos_t * p.x - sin_t * p.y, sin_t * p.x + cos_t * p.y),
            )
        })
        .collect();

    rotated.sort_by(|a, b| a.1.y.total_cmp(&b.1.y));
    let mut ordered = Vec::with_capacity(w * h);
    for row in rotated.chunks_mut(w) {
        row.sort_by(|a, b| a.1.x.total_cmp(&b.1.x));
        for (idx, _) in row.iter() {
            ordered.push(points[*idx]);
        }
    }
    Some(ordered)
}

/// Subpixel corner refinement by gradient orthogonality.
///
/// At the true corner every window gradient is orthogonal to the offset from
/// the corner; solving the weighted normal equations relocates the estimate,
/// iterated at most 30 times with a 0.001 px convergence threshold
/// (whichever stop condition triggers first), over a radius-11 window.
fn refine_subpixel(image: &FloatImage, corner: Vector2<f64>) -> Vector2<f64> {
    const WINDOW_RADIUS: i64 = 11;
    const MAX_ITERATIONS: u32 = 30;
    const EPS: f64 = 0.001;

    let sigma = WINDOW_RADIUS as f64 / 2.0;
    let mut current = corner;

    for _ in 0..MAX_ITERATIONS {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();

        for dy in -WINDOW_RADIUS..=WINDOW_RADIUS {
            for dx in -WINDOW_RADIUS..=WINDOW_RADIUS {
                let px = current.x + dx as f64;
                let py = current.y + dy as f64;
                if px < 1.0
                    || py < 1.0
                    || px > image.width as f64 - 2.0
                    || py > image.height as f64 - 2.0
                {
                    continue;
                }
                let gx = (image.bilinear(px + 1.0, py) - image.bilinear(px - 1.0, py)) as f64 / 2.0;
                let gy = (image.bilinear(px, py + 1.0) - image.bilinear(px, py - 1.0)) as f64 / 2.0;
                let weight =
                    (-((dx * dx + dy * dy) as f64) / (2.0 * sigma * sigma)).exp();

                let gxx = weight * gx * gx;
                let gxy = weight * gx * gy;
                let gyy = weight * gy * gy;
                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 0)] += gxy;
                a[(1, 1)] += gyy;
                b.x += gxx * px + gxy * py;
                b.y += gxy * px + gyy * py;
            }
        }

        let Some(inv) = a.try_inverse() else {
            break;
        };
        let updated = inv * b;
        let delta = (updated - current).norm();
        current = updated;
        if delta < EPS {
            break;
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;

    /// Renders an axis-aligned checkerboard with `(w + 1) x (h + 1)` squares
    /// so the board has `(w, h)` inner corners at known pixel positions.
    fn render_board(w: u32, h: u32, square: u32, origin: (u32, u32)) -> GrayImage {
        let img_w = origin.0 * 2 + (w + 1) * square;
        let img_h = origin.1 * 2 + (h + 1) * square;
        let mut image = GrayImage::from_pixel(img_w, img_h, Luma([160u8]));
        for sy in 0..h + 1 {
            for sx in 0..w + 1 {
                let value = if (sx + sy) % 2 == 0 { 32u8 } else { 224u8 };
                for py in 0..square {
                    for px in 0..square {
                        image.put_pixel(
                            origin.0 + sx * square + px,
                            origin.1 + sy * square + py,
                            Luma([value]),
                        );
                    }
                }
            }
        }
        image
    }

    #[test]
    fn test_detect_recovers_known_corners() {
        let (w, h, square) = (4u32, 3u32, 40u32);
        let origin = (60u32, 60u32);
        let image = render_board(w, h, square, origin);

        let record = detect(&image, (w, h), 0.05).unwrap();
        assert_eq!(record.keypoints2d.len(), (w * h) as usize);
        assert_eq!(record.keypoints3d.len(), (w * h) as usize);
        assert_eq!(record.pattern, [h, w]);
        assert_relative_eq!(record.grid_size, 0.05);
        assert!(record.visited);

        // Inner corner (i, j) sits at the shared edge of squares, i.e. at
        // origin + (i + 1, j + 1) * square - 0.5 in continuous coordinates.
        for i in 0..w as usize {
            for j in 0..h as usize {
                let n = i * h as usize + j;
                let expected_x = origin.0 as f64 + (i as f64 + 1.0) * square as f64 - 0.5;
                let expected_y = origin.1 as f64 + (j as f64 + 1.0) * square as f64 - 0.5;
                let [x, y, valid] = record.keypoints2d[n];
                assert!(
                    (x - expected_x).abs() < 0.5 && (y - expected_y).abs() < 0.5,
                    "corner ({i},{j}) off by ({}, {})",
                    x - expected_x,
                    y - expected_y
                );
                assert_eq!(valid, 1.0);

                let [ox, oy, oz] = record.keypoints3d[n];
                assert_relative_eq!(ox, i as f64 * 0.05);
                assert_relative_eq!(oy, j as f64 * 0.05);
                assert_relative_eq!(oz, 0.0);
            }
        }
    }

    #[test]
    fn test_detect_fails_on_blank_image() {
        let image = GrayImage::from_pixel(320, 240, Luma([128u8]));
        assert!(matches!(
            detect(&image, (4, 3), 0.05),
            Err(DetectError::BoardNotFound { .. })
        ));
    }

    #[test]
    fn test_detect_rejects_degenerate_pattern() {
        let image = GrayImage::from_pixel(64, 64, Luma([128u8]));
        assert!(matches!(
            detect(&image, (1, 3), 0.05),
            Err(DetectError::PatternTooSmall(1, 3))
        ));
        assert!(matches!(
            detect(&image, (4, 3), 0.0),
            Err(DetectError::BadGridSize(_))
        ));
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = CorrespondenceRecord {
            keypoints3d: vec![[0.0, 0.0, 0.0], [0.05, 0.0, 0.0]],
            keypoints2d: vec![[100.0, 120.0, 1.0], [140.0, 120.5, 0.0]],
            pattern: [3, 4],
            grid_size: 0.05,
            visited: true,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000.json");
        record.to_file(&path).unwrap();

        let loaded = CorrespondenceRecord::from_file(&path).unwrap();
        assert_eq!(loaded.keypoints3d, record.keypoints3d);
        assert_eq!(loaded.keypoints2d, record.keypoints2d);
        assert_eq!(loaded.pattern, [3, 4]);
        assert!(loaded.visited);
    }
}
