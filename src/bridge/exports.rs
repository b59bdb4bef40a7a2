//! Kernel export lookup
//!
//! Imports are bound against the export sets of modules already loaded in the
//! kernel. [`ExportTable`] keeps those sets keyed by normalised module name and
//! can populate itself by reading a module's export directory through the
//! bridge.

use std::collections::HashMap;

use super::KernelBridge;
use crate::error::{MapError, Result};
use crate::image::pe;
use crate::image::ImportName;

const HEADER_READ_SIZE: usize = 0x1000;

pub trait ExportLookup {
    fn lookup(&mut self, module: &str, symbol: &ImportName) -> Option<u64>;
}

/// `ntoskrnl.exe`, `NTOSKRNL` and `ntoskrnl.EXE` all name the same module.
fn normalize(module: &str) -> String {
    let lower = module.to_ascii_lowercase();
    match lower.rsplit_once('.') {
        Some((stem, "exe" | "sys" | "dll")) => stem.to_string(),
        _ => lower,
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModuleExports {
    pub base: u64,
    by_name: HashMap<String, u64>,
    by_ordinal: HashMap<u16, u64>,
}

impl ModuleExports {
    pub fn new(base: u64) -> Self {
        Self { base, ..Self::default() }
    }

    pub fn insert(&mut self, name: impl Into<String>, ordinal: Option<u16>, address: u64) {
        self.by_name.insert(name.into(), address);
        if let Some(ordinal) = ordinal {
            self.by_ordinal.insert(ordinal, address);
        }
    }

    pub fn insert_ordinal(&mut self, ordinal: u16, address: u64) {
        self.by_ordinal.insert(ordinal, address);
    }

    pub fn get(&self, symbol: &ImportName) -> Option<u64> {
        match symbol {
            ImportName::Name(name) => self.by_name.get(name).copied(),
            ImportName::Ordinal(ordinal) => self.by_ordinal.get(ordinal).copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.by_ordinal.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExportTable {
    modules: HashMap<String, ModuleExports>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, name: &str, exports: ModuleExports) {
        self.modules.insert(normalize(name), exports);
    }

    pub fn module(&self, name: &str) -> Option<&ModuleExports> {
        self.modules.get(&normalize(name))
    }

    pub fn module_mut(&mut self, name: &str) -> &mut ModuleExports {
        self.modules.entry(normalize(name)).or_default()
    }

    /// Reads the export directory of the module loaded at `base` through the
    /// bridge and registers it under `name`. Forwarded exports are skipped.
    pub fn load_module<B: KernelBridge + ?Sized>(&mut self, bridge: &mut B, name: &str, base: u64) -> Result<usize> {
        let headers = read(bridge, base, HEADER_READ_SIZE)?;
        let nt = pe::NtHeaders::decode(&headers)?;
        let dir = nt.directory(pe::IMAGE_DIRECTORY_ENTRY_EXPORT);
        if !dir.is_present() {
            return Err(MapError::invalid(format!("{} has no export directory", name)));
        }

        let export_dir = read(bridge, base + dir.virtual_address as u64, pe::EXPORT_DIRECTORY_SIZE)?;
        let ordinal_base = pe::read_u32(&export_dir, 16)?;
        let number_of_functions = pe::read_u32(&export_dir, 20)? as usize;
        let number_of_names = pe::read_u32(&export_dir, 24)? as usize;
        let functions_rva = pe::read_u32(&export_dir, 28)? as u64;
        let names_rva = pe::read_u32(&export_dir, 32)? as u64;
        let ordinals_rva = pe::read_u32(&export_dir, 36)? as u64;

        let functions = read(bridge, base + functions_rva, number_of_functions * 4)?;
        let names = read(bridge, base + names_rva, number_of_names * 4)?;
        let ordinals = read(bridge, base + ordinals_rva, number_of_names * 2)?;

        let forwarder_range = dir.virtual_address..dir.virtual_address.saturating_add(dir.size);
        let mut module = ModuleExports::new(base);
        let mut named = vec![false; number_of_functions];

        for i in 0..number_of_names {
            let name_rva = pe::read_u32(&names, i * 4)?;
            let index = pe::read_u16(&ordinals, i * 2)? as usize;
            if name_rva == 0 || index >= number_of_functions {
                continue;
            }
            let function_rva = pe::read_u32(&functions, index * 4)?;
            if forwarder_range.contains(&function_rva) {
                log::debug!("[Bridge] {}: skipping forwarded export #{}", name, i);
                continue;
            }

            let symbol = read_remote_cstr(bridge, base + name_rva as u64)?;
            let ordinal = u16::try_from(ordinal_base as usize + index).ok();
            module.insert(symbol, ordinal, base + function_rva as u64);
            named[index] = true;
        }

        for (index, is_named) in named.iter().enumerate() {
            let function_rva = pe::read_u32(&functions, index * 4)?;
            if *is_named || function_rva == 0 || forwarder_range.contains(&function_rva) {
                continue;
            }
            if let Ok(ordinal) = u16::try_from(ordinal_base as usize + index) {
                module.insert_ordinal(ordinal, base + function_rva as u64);
            }
        }

        let count = module.len();
        log::info!("[Bridge] {} at {:#x}: {} named exports", name, base, count);
        self.add_module(name, module);
        Ok(count)
    }
}

impl ExportLookup for ExportTable {
    fn lookup(&mut self, module: &str, symbol: &ImportName) -> Option<u64> {
        self.module(module)?.get(symbol)
    }
}

fn read<B: KernelBridge + ?Sized>(bridge: &mut B, address: u64, len: usize) -> Result<Vec<u8>> {
    bridge
        .read(address, len)
        .map_err(|source| MapError::ReadFailure { address, len, source })
}

/// Reads in 64-byte chunks, halving the chunk when a read runs off the end of
/// the mapped module.
fn read_remote_cstr<B: KernelBridge + ?Sized>(bridge: &mut B, address: u64) -> Result<String> {
    let mut out = Vec::new();
    let mut cursor = address;
    let mut chunk_len = 64;
    loop {
        let chunk = match bridge.read(cursor, chunk_len) {
            Ok(chunk) => chunk,
            Err(_) if chunk_len > 1 => {
                chunk_len /= 2;
                continue;
            }
            Err(source) => return Err(MapError::ReadFailure { address: cursor, len: chunk_len, source }),
        };
        if let Some(end) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..end]);
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.extend_from_slice(&chunk);
        if out.len() > 512 {
            return Err(MapError::invalid(format!("export name at {:#x} is unterminated", address)));
        }
        cursor += chunk.len() as u64;
    }
}
