//! CLI entry point for the PCO driver simulator.
//!
//! Runs a driver instance against the in-memory camera and plays the part of
//! the camera hardware: frames are written into the submitted buffers and
//! reported ready, exactly as the SDK callback would.
//!
//! # Usage
//!
//! Acquire ten images, summing four exposures each:
//! ```bash
//! pco-sim acquire --images 10 --exposures 4
//! ```
//!
//! Simulate a camera that skips every fifth frame number:
//! ```bash
//! pco-sim acquire --images 20 --skip-every 5
//! ```
//!
//! Print the effective configuration:
//! ```bash
//! pco-sim --config config/pco.toml config
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pco_daq::config::DriverConfig;
use pco_daq::driver::{DriverHandle, PcoDriver};
use pco_daq::error::AppResult;
use pco_daq::logging::{self, LogConfig, OutputFormat};
use pco_daq::mock::MockCamera;
use pco_daq::pipeline::Outputs;
use pco_daq::registry::DriverRegistry;
use pco_daq::sdk::{CameraSdk, TriggerMode};
use pco_daq::sink::BroadcastSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pco-sim")]
#[command(about = "Drive a simulated PCO camera through its acquisition lifecycle", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Built-in defaults apply without one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact", global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire images from the simulated camera and print the final status
    Acquire {
        /// Number of images to acquire
        #[arg(long, default_value_t = 10)]
        images: u32,

        /// Exposures summed into each image
        #[arg(long, default_value_t = 1)]
        exposures: u32,

        /// Sensor width in pixels
        #[arg(long, default_value_t = 640)]
        width: u32,

        /// Sensor height in pixels
        #[arg(long, default_value_t = 480)]
        height: u32,

        #[arg(long, value_enum, default_value = "auto")]
        trigger: Trigger,

        /// Skip one camera frame number after every N frames (0 = never)
        #[arg(long, default_value_t = 0)]
        skip_every: u32,

        /// Delay before the first connection attempt, in milliseconds
        #[arg(long, default_value_t = 100)]
        connect_delay_ms: u64,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Trigger {
    Auto,
    Software,
    External,
}

impl From<Trigger> for TriggerMode {
    fn from(value: Trigger) -> Self {
        match value {
            Trigger::Auto => TriggerMode::Auto,
            Trigger::Software => TriggerMode::Software,
            Trigger::External => TriggerMode::External,
        }
    }
}

struct AcquireArgs {
    images: u32,
    exposures: u32,
    width: u32,
    height: u32,
    trigger: Trigger,
    skip_every: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DriverConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::default(),
    };
    config.validate()?;
    logging::init(LogConfig::from_driver_config(&config)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Acquire {
            images,
            exposures,
            width,
            height,
            trigger,
            skip_every,
            connect_delay_ms,
        } => {
            let mut config = config;
            config.timing.connect_period = Duration::from_millis(connect_delay_ms);
            acquire(
                config,
                AcquireArgs {
                    images,
                    exposures,
                    width,
                    height,
                    trigger,
                    skip_every,
                },
            )
            .await
        }
    }
}

async fn acquire(config: DriverConfig, args: AcquireArgs) -> Result<()> {
    if args.images == 0 {
        bail!("--images must be at least 1");
    }

    let camera = Arc::new(MockCamera::small(args.width, args.height));
    let sink = BroadcastSink::new(config.driver.max_arrays.max(16));
    let mut images = sink.subscribe();
    let sdk: Arc<dyn CameraSdk> = camera.clone();
    let driver = PcoDriver::spawn(&config, sdk, Outputs::new(sink))?;
    let mut registry = DriverRegistry::new();
    registry.register(driver.handle())?;
    let handle = registry.get(&config.driver.port_name)?.clone();
    let mut status = handle.subscribe();

    tokio::time::timeout(Duration::from_secs(30), status.wait_for(|s| s.connected))
        .await
        .context("camera did not connect")??;
    info!(port = %handle.port_name(), "connected");

    handle.update_settings(|s| {
        s.num_images = args.images;
        s.num_exposures = args.exposures.max(1);
        s.trigger_mode = args.trigger.into();
    });
    post_with_retry(&handle, DriverHandle::acquire).await?;
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.acquiring))
        .await
        .context("acquisition did not start")??;

    // The simulated hardware writes frames until the driver stops submitting buffers
    let receiver = driver.receiver();
    let frames_needed = args.images * args.exposures.max(1);
    let skip_every = args.skip_every;
    let hardware = tokio::task::spawn_blocking(move || {
        let mut number = 0u32;
        for written in 1..=frames_needed {
            number += 1;
            if skip_every > 0 && written % skip_every == 0 {
                number += 1;
            }
            let (_, _, pixels) = camera.frame(number, (written % 1000) as u16);
            let mut attempts = 0;
            while receiver.deliver(&pixels).is_none() {
                attempts += 1;
                if attempts > 500 {
                    return written - 1;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        frames_needed
    });

    for _ in 0..args.images {
        let image = tokio::time::timeout(Duration::from_secs(10), images.recv())
            .await
            .context("timed out waiting for an image")??;
        info!(
            id = image.unique_id,
            frame = image.frame_number,
            width = image.width,
            height = image.height,
            "image"
        );
    }

    let written = hardware.await?;
    info!(written, "simulated hardware finished");
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| !s.acquiring))
        .await
        .context("acquisition did not complete")??;

    println!("{}", serde_json::to_string_pretty(&handle.status())?);
    registry.remove(handle.port_name())?;
    driver.shutdown()?;
    Ok(())
}

/// Post a command, retrying a few times while the failure is transient.
async fn post_with_retry(
    handle: &DriverHandle,
    command: impl Fn(&DriverHandle) -> AppResult<()>,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match command(handle) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < 5 => {
                warn!(port = %handle.port_name(), attempt, error = %e, "command not accepted, retrying");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
