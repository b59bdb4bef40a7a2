//! Dry-run loader
//!
//! Usage: byte-driver-loader <driver.sys> [config.json]
//!
//! Validates a driver and maps it into the in-memory kernel with the same
//! options a real load would use. Nothing reaches the running kernel.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use byte_driver_loader::bridge::simulated::SimulatedKernel;
use byte_driver_loader::{config, map_driver, ImageDescriptor, LoaderConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args_os().skip(1);
    let driver = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: byte-driver-loader <driver.sys> [config.json]"))?;
    let config_path = args.next().map(PathBuf::from).unwrap_or_else(config::config_path);

    let bytes = std::fs::read(&driver).with_context(|| format!("cannot read {}", driver.display()))?;
    let config = LoaderConfig::load(&config_path)?;
    info!("Driver: {} ({} bytes)", driver.display(), bytes.len());
    info!("Options: {:?}", config);

    let descriptor = ImageDescriptor::parse(&bytes)?;
    info!(
        "Image: {} sections, {} imports, {} relocations",
        descriptor.sections.len(),
        descriptor.imports.len(),
        descriptor.relocations.len()
    );

    let kernel = SimulatedKernel::new().with_synthetic_exports();
    match map_driver(kernel.helper(), &bytes, config.into_options()) {
        Ok(result) => {
            info!("Mapped at {:#x}", result.base);
            if result.entry_status.is_success() {
                info!("Entry point returned {}", result.entry_status);
            } else {
                warn!("Entry point returned failure status {}", result.entry_status);
            }
            Ok(())
        }
        Err(failure) => {
            error!("{}", failure);
            if let Some(live) = failure.mapped {
                warn!("Image left running at {:#x} (entry returned {})", live.base, live.entry_status);
            }
            Err(failure.into())
        }
    }
}
