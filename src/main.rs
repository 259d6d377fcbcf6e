use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quadruped_motion_runtime::config::{CALIBRATION_PATH, MOTOR_PORT, MotionConfig};
use quadruped_motion_runtime::runtime::{self, RuntimeOptions};

/// Quadruped motion runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Motion config JSON (geometry, gait, safety); defaults if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Calibration file, created on first save
    #[arg(long, default_value = CALIBRATION_PATH)]
    calibration: PathBuf,

    /// Serial port of the servo bus
    #[arg(short, long, default_value = MOTOR_PORT)]
    port: String,

    /// Run without servos
    #[arg(short, long)]
    simulate: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!("Loading motion config from {}", path.display());
            MotionConfig::load(path)
        }
        None => {
            let config = MotionConfig::default();
            config.validate().map(|()| config)
        }
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    let options = RuntimeOptions {
        config,
        calibration_path: args.calibration,
        port: args.port,
        simulate: args.simulate,
    };

    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
