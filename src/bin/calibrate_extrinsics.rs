//! Perform extrinsic calibration for every camera of a rig from detected
//! checkerboard correspondences.
//!
//! Usage:
//! ```bash
//! calibrate_extrinsics /data/rig --intri /data/rig/intri.yml --image-id 0
//! ```

use clap::Parser;
use multiview_calib::pipeline;
use std::path::PathBuf;
use std::process::ExitCode;

/// Extrinsic camera calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory containing the 'chessboard' folder
    path: PathBuf,

    /// Path to the intrinsic calibration file (intri.yml)
    #[arg(long)]
    intri: PathBuf,

    /// Index of the correspondence record to use per camera
    #[arg(long, default_value = "0")]
    image_id: usize,

    /// Path to the output extrinsic file; defaults to 'extri.yml' in the
    /// root path
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let summary = match pipeline::run(&cli.path, &cli.intri, cli.image_id, cli.output.as_deref()) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    for cam in &summary.solved {
        let c = cam.camera_center;
        println!(
            "Camera '{}': reprojection error = {:.3}px, camera center = [{:.4}, {:.4}, {:.4}]",
            cam.name, cam.reprojection_error, c.x, c.y, c.z
        );
    }
    for cam in &summary.skipped {
        eprintln!("Warning: camera '{}' skipped: {}", cam.name, cam.reason);
    }
    println!(
        "Extrinsic parameters successfully written to {}",
        summary.output_path.display()
    );
    ExitCode::SUCCESS
}
