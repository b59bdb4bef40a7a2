//! Usage: driver-to-bytes <driver.sys> [output.rs]
//!
//! Writes the driver as a `DRIVER_BYTES` array for embedding. The output
//! defaults to the input path with an `.rs` extension.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use byte_driver_loader::embed;

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args_os().skip(1);
    let input = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: driver-to-bytes <driver.sys> [output.rs]"))?;
    let output = args.next().map(PathBuf::from).unwrap_or_else(|| input.with_extension("rs"));

    let bytes = std::fs::read(&input).with_context(|| format!("cannot read {}", input.display()))?;
    let source = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string());
    let text = embed::render(&bytes, &source)?;

    std::fs::write(&output, text).with_context(|| format!("cannot write {}", output.display()))?;
    println!("Wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}
