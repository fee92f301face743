//! Visual sanity check for solved extrinsics.
//!
//! Projects a unit-cube wireframe sitting at the world origin into each
//! camera's sample image. The camera's native image is distorted, so the
//! cube is first projected through the full distorted model, then the image
//! is undistorted and the projected points are re-mapped into the
//! undistorted plane before drawing; the edges then land on the correct
//! undistorted pixels.

use crate::camera::{distort_normalized, CameraError, CameraIntrinsics};
use crate::format::{ExtrinsicsStore, FormatError, IntrinsicsStore, MatrixYamlCodec};
use crate::pnp::PoseRecord;
use image::{imageops, Rgb, RgbImage};
use log::warn;
use nalgebra::{Vector2, Vector3};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Failed to load calibration: {0}")]
    Format(#[from] FormatError),
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("No camera produced an image")]
    NoImages,
}

const EDGE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const MAX_COMPOSITE_WIDTH: u32 = 1920;

/// Canonical unit-cube wireframe: 8 vertices of an axis-aligned cube with
/// the given edge length anchored at the origin, and its 12 edges in fixed
/// order (bottom face, top face, then the four verticals).
pub fn wireframe_cube(edge: f64) -> ([Vector3<f64>; 8], [(usize, usize); 12]) {
    let vertices = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(edge, 0.0, 0.0),
        Vector3::new(edge, edge, 0.0),
        Vector3::new(0.0, edge, 0.0),
        Vector3::new(0.0, 0.0, edge),
        Vector3::new(edge, 0.0, edge),
        Vector3::new(edge, edge, edge),
        Vector3::new(0.0, edge, edge),
    ];
    let edges = [
        (0, 1),
        (1, 2),
        (2, 3),
        (3, 0),
        (4, 5),
        (5, 6),
        (6, 7),
        (7, 4),
        (0, 4),
        (1, 5),
        (2, 6),
        (3, 7),
    ];
    (vertices, edges)
}

/// Renders the composite verification image for a rig directory containing
/// `intri.yml`, `extri.yml` and `images/<camera>/` sample frames. Cameras
/// with missing data are skipped; only an empty composite is an error.
pub fn render(rig_root: &Path) -> Result<RgbImage, RenderError> {
    let codec = MatrixYamlCodec;
    let cameras = IntrinsicsStore::new(codec.clone()).load(&rig_root.join("intri.yml"))?;
    let poses = ExtrinsicsStore::new(codec).read(&rig_root.join("extri.yml"))?;

    let (cube, edges) = wireframe_cube(1.0);
    let mut panels = Vec::new();

    for (name, camera) in &cameras {
        let Some(pose) = poses.get(name) else {
            warn!("No extrinsics entry for camera '{name}', skipping");
            continue;
        };
        let image_dir = rig_root.join("images").join(name);
        let Some(image_path) = first_image(&image_dir) else {
            warn!("No images found for camera '{name}' in '{}'", image_dir.display());
            continue;
        };
        let image = match image::open(&image_path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!("Could not read '{}': {e}", image_path.display());
                continue;
            }
        };

        match draw_cube_panel(&image, camera, pose, &cube, &edges) {
            Ok(panel) => panels.push(panel),
            Err(e) => warn!("Could not render camera '{name}': {e}"),
        }
    }

    if panels.is_empty() {
        return Err(RenderError::NoImages);
    }
    Ok(compose(panels))
}

/// First sample image of a camera, lexicographically.
fn first_image(dir: &Path) -> Option<PathBuf> {
    const EXTENSIONS: [&str; 5] = ["jpg", "png", "jpeg", "bmp", "tiff"];
    let entries = fs::read_dir(dir).ok()?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files.into_iter().next()
}

fn draw_cube_panel(
    image: &RgbImage,
    camera: &CameraIntrinsics,
    pose: &PoseRecord,
    cube: &[Vector3<f64>; 8],
    edges: &[(usize, usize); 12],
) -> Result<RgbImage, RenderError> {
    // Distorted projections of the cube vertices.
    let mut distorted = Vec::with_capacity(cube.len());
    for vertex in cube {
        let pc = pose.rot * vertex + pose.t;
        distorted.push(camera.project(&pc)?);
    }

    // The drawing surface is the undistorted image, so the projected points
    // must be moved into the undistorted plane as well.
    let mut undistorted_points = Vec::with_capacity(distorted.len());
    for point in &distorted {
        undistorted_points.push(camera.undistort_pixel(point)?);
    }

    let mut panel = undistort_image(image, camera);
    for (a, b) in edges {
        draw_segment(&mut panel, undistorted_points[*a], undistorted_points[*b]);
    }
    Ok(panel)
}

/// Undistorts an image by inverse mapping: each output pixel is pushed
/// through the distortion model to find its source position, then sampled
/// bilinearly. Out-of-frame sources stay black.
fn undistort_image(image: &RgbImage, camera: &CameraIntrinsics) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut output = RgbImage::new(width, height);

    for v in 0..height {
        for u in 0..width {
            let x = (u as f64 - camera.cx()) / camera.fx();
            let y = (v as f64 - camera.cy()) / camera.fy();
            let (xd, yd) = distort_normalized(&camera.dist, x, y);
            let src_u = camera.fx() * xd + camera.cx();
            let src_v = camera.fy() * yd + camera.cy();
            if let Some(pixel) = sample_bilinear(image, src_u, src_v) {
                output.put_pixel(u, v, pixel);
            }
        }
    }
    output
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<Rgb<u8>> {
    let (width, height) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > width as f64 - 1.0 || y > height as f64 - 1.0 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut channels = [0u8; 3];
    for (c, channel) in channels.iter_mut().enumerate() {
        let p00 = image.get_pixel(x0, y0).0[c] as f64;
        let p10 = image.get_pixel(x1, y0).0[c] as f64;
        let p01 = image.get_pixel(x0, y1).0[c] as f64;
        let p11 = image.get_pixel(x1, y1).0[c] as f64;
        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        *channel = (top * (1.0 - fy) + bottom * fy).round() as u8;
    }
    Some(Rgb(channels))
}

/// Draws a 2 px thick line segment by stepping along its length.
fn draw_segment(image: &mut RgbImage, from: Vector2<f64>, to: Vector2<f64>) {
    let delta = to - from;
    let length = delta.norm();
    if length < f64::EPSILON {
        return;
    }
    let steps = length.ceil() as usize * 2;
    let (width, height) = image.dimensions();

    for step in 0..=steps {
        let p = from + delta * (step as f64 / steps as f64);
        for dy in 0..2i64 {
            for dx in 0..2i64 {
                let x = p.x.round() as i64 + dx;
                let y = p.y.round() as i64 + dy;
                if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                    image.put_pixel(x as u32, y as u32, EDGE_COLOR);
                }
            }
        }
    }
}

/// Juxtaposes the per-camera panels horizontally and caps the composite
/// width at 1920 px.
fn compose(panels: Vec<RgbImage>) -> RgbImage {
    let total_width: u32 = panels.iter().map(|p| p.width()).sum();
    let max_height = panels.iter().map(|p| p.height()).max().unwrap_or(1);

    let mut composite = RgbImage::new(total_width, max_height);
    let mut offset = 0;
    for panel in &panels {
        imageops::overlay(&mut composite, panel, i64::from(offset), 0);
        offset += panel.width();
    }

    if composite.width() > MAX_COMPOSITE_WIDTH {
        let scale = MAX_COMPOSITE_WIDTH as f64 / composite.width() as f64;
        let new_height = ((composite.height() as f64) * scale).round().max(1.0) as u32;
        composite = imageops::resize(
            &composite,
            MAX_COMPOSITE_WIDTH,
            new_height,
            imageops::FilterType::Triangle,
        );
    }
    composite
}
