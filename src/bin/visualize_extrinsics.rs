//! Project a wireframe cube into each rig camera's sample image using the
//! solved calibration, as a visual sanity check.
//!
//! Usage:
//! ```bash
//! visualize_extrinsics /data/rig --output cube_check.png
//! ```

use clap::Parser;
use multiview_calib::render;
use std::path::PathBuf;
use std::process::ExitCode;

/// Extrinsics visualization tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the directory containing intri.yml, extri.yml and the
    /// images folder
    path: PathBuf,

    /// Path to the output composite image
    #[arg(short, long, default_value = "projected_cube.png")]
    output: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let composite = match render::render(&cli.path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = composite.save(&cli.output) {
        eprintln!("Error writing '{}': {e}", cli.output.display());
        return ExitCode::FAILURE;
    }
    println!("Projected cube written to {}", cli.output.display());
    ExitCode::SUCCESS
}
