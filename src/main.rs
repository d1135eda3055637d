//! Cam-frame-grabber binary for trying out capture devices.

use std::path::PathBuf;
use std::time::Duration;

use cam_frame_grabber::registry::{self, HostContext, V4L2_COMPONENT};
use cam_frame_grabber::{Attributes, CaptureBackend, V4L2Backend};
use clap::{Parser, Subcommand};
use crossbeam_channel::select;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cam-frame-grabber", version, about = "Camera frame acquisition driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List capture devices and registered components.
    ListDevices,
    /// Build a grabber and print the measurements it produces.
    Run {
        /// TOML file of grabber attributes.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Component type to instantiate.
        #[arg(long, default_value = V4L2_COMPONENT)]
        component: String,
        /// Number of color frames to receive before exiting.
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
    },
}

/// How long to wait for the next frame before giving up.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli.command) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(command: Command) -> cam_frame_grabber::Result<()> {
    match command {
        Command::ListDevices => list_devices(),
        Command::Run {
            config,
            component,
            frames,
        } => {
            let attributes = match config {
                Some(path) => Attributes::load(&path)?,
                None => Attributes::new(),
            };
            let result = capture(&component, &attributes, frames);
            registry::shutdown();
            result
        }
    }
}

fn list_devices() -> cam_frame_grabber::Result<()> {
    let devices = V4L2Backend::new().enumerate()?;
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for device in devices {
        println!("[{}] {} ({})", device.index, device.name, device.path);
    }

    let registry = registry::global()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    println!("Components: {}", registry.names().join(", "));
    Ok(())
}

fn capture(component: &str, attributes: &Attributes, frames: usize) -> cam_frame_grabber::Result<()> {
    let grabber = registry::global()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .create(component, "grabber", attributes, &HostContext::default())?;

    println!(
        "Device: {} ({}x{})",
        grabber.device().name,
        grabber.width(),
        grabber.height()
    );

    let color = grabber.color_output().connect();
    let luminance = grabber.luminance_output().connect();
    grabber.start()?;

    let mut received = 0;
    while received < frames {
        select! {
            recv(color) -> msg => match msg {
                Ok(frame) => {
                    received += 1;
                    println!(
                        "Color {received}: {}x{} @ {}",
                        frame.value.width(),
                        frame.value.height(),
                        frame.timestamp
                    );
                }
                Err(_) => break,
            },
            recv(luminance) -> msg => {
                if let Ok(frame) = msg {
                    println!(
                        "Luminance: {}x{} @ {}",
                        frame.value.width(),
                        frame.value.height(),
                        frame.timestamp
                    );
                }
            },
            default(FRAME_TIMEOUT) => {
                eprintln!("Timed out waiting for frames");
                break;
            }
        }
    }

    grabber.stop()?;
    println!(
        "Frames seen: {}, forwarded: {}",
        grabber.dispatcher().frames_seen(),
        grabber.dispatcher().frames_forwarded()
    );
    Ok(())
}
