//! Find checkerboard corners in an image and save them to a JSON file.
//!
//! Usage:
//! ```bash
//! find_checkerboard photo.png --dimensions 4x5 --grid 0.05
//! ```

use clap::Parser;
use log::info;
use multiview_calib::board;
use std::path::PathBuf;
use std::process::ExitCode;

/// Checkerboard corner detection tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the input image
    image: PathBuf,

    /// Checkerboard inner corner dimensions as WxH, e.g. '4x5'
    #[arg(short, long)]
    dimensions: String,

    /// Edge length of one checkerboard square (e.g. in meters)
    #[arg(short, long)]
    grid: f64,

    /// Path to the output JSON file; defaults to the image name with a
    /// .json extension
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_dimensions(spec: &str) -> Option<(u32, u32)> {
    let (w, h) = spec.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let Some(pattern_size) = parse_dimensions(&cli.dimensions) else {
        eprintln!(
            "Error: --dimensions must be in WxH format, e.g. '4x5'. Got '{}'.",
            cli.dimensions
        );
        return ExitCode::FAILURE;
    };

    let image = match image::open(&cli.image) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            eprintln!("Error: could not read image at '{}': {e}", cli.image.display());
            return ExitCode::FAILURE;
        }
    };

    let record = match board::detect(&image, pattern_size, cli.grid) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Found {} corners for pattern {}x{}",
        record.keypoints2d.len(),
        pattern_size.0,
        pattern_size.1
    );

    let output_path = cli
        .output
        .unwrap_or_else(|| cli.image.with_extension("json"));
    if let Err(e) = record.to_file(&output_path) {
        eprintln!("Error writing to '{}': {e}", output_path.display());
        return ExitCode::FAILURE;
    }

    println!(
        "Successfully found checkerboard. Output written to {}",
        output_path.display()
    );
    ExitCode::SUCCESS
}
