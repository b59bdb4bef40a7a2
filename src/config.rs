//! Loader configuration
//! Loads and saves mapping options from a small JSON file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::bridge::AllocationMode;
use crate::mapper::MapOptions;

/// Default config file: `loader_config.json` next to the executable
pub fn config_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap_or_default();
    path.set_file_name("loader_config.json");
    path
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoaderConfig {
    pub free_after_entry: bool,
    pub destroy_headers: bool,
    pub allocation_mode: AllocationMode,
    pub pass_allocation_address: bool,
    pub param1: u64,
    pub param2: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            free_after_entry: false,
            destroy_headers: true,
            allocation_mode: AllocationMode::Pool,
            pass_allocation_address: false,
            param1: 0,
            param2: 0,
        }
    }
}

impl LoaderConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))?;
                log::info!("[Config] loaded {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[Config] {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = format!(
            r#"{{
  "free_after_entry": {},
  "destroy_headers": {},
  "allocation_mode": "{}",
  "pass_allocation_address": {},
  "param1": "{:#x}",
  "param2": "{:#x}"
}}
"#,
            self.free_after_entry,
            self.destroy_headers,
            self.allocation_mode.name(),
            self.pass_allocation_address,
            self.param1,
            self.param2
        );

        fs::write(path, content).with_context(|| format!("cannot write {}", path.display()))?;
        log::info!("[Config] saved to {}", path.display());
        Ok(())
    }

    /// Parse JSON line by line (no serde dependency). One key per line;
    /// unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim().trim_end_matches(',').trim().trim_matches('"');

            match key {
                "free_after_entry" => config.free_after_entry = parse_bool(key, value)?,
                "destroy_headers" => config.destroy_headers = parse_bool(key, value)?,
                "pass_allocation_address" => config.pass_allocation_address = parse_bool(key, value)?,
                "allocation_mode" => {
                    config.allocation_mode = AllocationMode::from_name(value)
                        .ok_or_else(|| anyhow!("unknown allocation_mode {:?}", value))?;
                }
                "param1" => config.param1 = parse_u64(key, value)?,
                "param2" => config.param2 = parse_u64(key, value)?,
                other => log::debug!("[Config] ignoring key {:?}", other),
            }
        }

        Ok(config)
    }

    pub fn into_options(self) -> MapOptions {
        MapOptions {
            free_after_entry: self.free_after_entry,
            destroy_headers: self.destroy_headers,
            allocation_mode: self.allocation_mode,
            pass_allocation_address: self.pass_allocation_address,
            param1: self.param1,
            param2: self.param2,
            entry_callback: None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("{} must be true or false, got {:?}", key, value),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("{} is not a number: {:?}", key, value))
}
