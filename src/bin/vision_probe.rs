use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use companion_vision::config::parse_camera_label;
use companion_vision::{
    CameraStatus, DeviceConfig, PixelFormat, Resolution, ScriptedDriver, VideoFrame, VisionConfig,
    VisionSystem,
};

/// Companion Vision probe - run the capture subsystem without the GUI
#[derive(Parser, Debug)]
#[command(name = "vision-probe", version, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera to open ("2", "Camera 2" or "Default")
    #[arg(long)]
    camera: Option<String>,

    /// Capture resolution as WxH (e.g., "1280x720")
    #[arg(short, long)]
    resolution: Option<String>,

    /// How long to run, in seconds
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Use a synthetic camera instead of real hardware
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// List capture devices and exit
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Print info as JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Write the last captured frame to this PNG file on exit
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if args.list {
        return list_cameras(args.json);
    }

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            VisionConfig::load(path)?
        }
        None => VisionConfig::default(),
    };
    if let Some(label) = &args.camera {
        config.device.index = parse_camera_label(label);
    }
    if let Some(resolution) = &args.resolution {
        config.device.set_resolution(Resolution::parse_or_default(resolution));
    }

    let (system, simulated) = if args.simulate {
        let driver = synthetic_camera();
        let system = VisionSystem::new(Box::new(driver.clone()), config.clone())?;
        (system, Some(driver))
    } else {
        (VisionSystem::with_default_driver(config.clone())?, None)
    };

    system.register_callbacks(
        |_frame| {},
        |err| warn!("vision error: {}", err),
        |_info| {},
    );

    info!(
        "Starting camera {} at {}",
        config.device.index,
        config.device.resolution()
    );
    system.start()?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut stalled = false;
    while Instant::now() < deadline {
        thread::sleep(Duration::from_secs(1));

        // Halfway through a simulated run, stall the camera long enough to trigger recovery
        if let Some(driver) = &simulated {
            if !stalled && deadline.saturating_duration_since(Instant::now()) < Duration::from_secs(args.seconds / 2) {
                info!("Simulating a stalled camera");
                driver.fail_reads(config.recovery.failure_threshold);
                stalled = true;
            }
        }

        let snapshot = system.info();
        if args.json {
            println!("{}", snapshot.to_json()?);
        } else {
            println!(
                "[{}] {:5.1} fps  frames={}  face={}  recoveries={}",
                system.status_text(),
                snapshot.fps,
                snapshot.frame_count,
                snapshot.face_detected,
                snapshot.recovery_attempts
            );
        }

        if snapshot.camera_status == CameraStatus::Error {
            warn!("Camera in error state, attempting recovery");
            if system.attempt_recovery() {
                info!("✓ Camera recovered");
            } else {
                error!("Recovery failed: {}", snapshot.last_error.unwrap_or_default());
            }
        }
    }

    if let Some(path) = &args.snapshot {
        save_snapshot(&system, path);
    }

    system.stop()?;
    println!("{}", system.info().summary());
    Ok(())
}

fn save_snapshot(system: &VisionSystem, path: &Path) {
    let Some(frame) = system.capture_snapshot() else {
        warn!("No frame captured, snapshot not written");
        return;
    };
    match frame.to_rgba_image() {
        Some(img) => match img.save(path) {
            Ok(()) => info!("Snapshot written to {}", path.display()),
            Err(e) => error!("Failed to write snapshot: {}", e),
        },
        None => warn!("Captured frame could not be converted, snapshot not written"),
    }
}

#[cfg(target_os = "linux")]
fn list_cameras(json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let cameras = companion_vision::enumerate_cameras(16);
    if json {
        println!("{}", serde_json::to_string_pretty(&cameras)?);
        return Ok(());
    }
    if cameras.is_empty() {
        println!("No cameras found");
    }
    for camera in cameras {
        println!("{}: {} ({})", camera.label(), camera.name, camera.resolutions.join(", "));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn list_cameras(_json: bool) -> Result<(), Box<dyn std::error::Error>> {
    Err(companion_vision::VisionError::UnsupportedPlatform.into())
}

/// Scripted camera showing a bright face-like block drifting across the frame
fn synthetic_camera() -> ScriptedDriver {
    ScriptedDriver::new().with_frames(|number, device: &DeviceConfig| {
        let (width, height) = (device.width.min(320), device.height.min(240));
        let size = height / 2;
        let x = (number as u32 * 2) % width.saturating_sub(size).max(1);
        let y = height / 4;
        let eyes = y + size / 5..y + size * 9 / 20;

        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for py in 0..height {
            for px in 0..width {
                let inside = px >= x && px < x + size && py >= y && py < y + size;
                let level = match (inside, eyes.contains(&py)) {
                    (true, true) => 40,
                    (true, false) => 200,
                    (false, _) => 100,
                };
                data.extend_from_slice(&[level, level, level, 255]);
            }
        }
        VideoFrame::new(width, height, PixelFormat::Rgba, data, number)
    })
}
