//! Import resolver
//!
//! Binds each imported symbol to a live kernel export and writes the address
//! into its IAT slot. Resolution is all-or-nothing: every symbol is looked up
//! before the first slot is patched, so a miss leaves the image untouched.

use crate::bridge::ExportLookup;
use crate::error::{MapError, Result};
use crate::image::ImportedSymbol;

/// Returns the number of patched slots.
pub fn resolve<L: ExportLookup + ?Sized>(image: &mut [u8], imports: &[ImportedSymbol], lookup: &mut L) -> Result<usize> {
    let mut resolved = Vec::with_capacity(imports.len());

    for import in imports {
        let address = lookup.lookup(&import.module, &import.symbol).ok_or_else(|| {
            log::error!("[Imports] {}!{} not exported by the running kernel", import.module, import.symbol);
            MapError::UnresolvedImport {
                module: import.module.clone(),
                symbol: import.symbol.to_string(),
            }
        })?;
        log::debug!("[Imports] {}!{} = {:#x}", import.module, import.symbol, address);
        resolved.push((import, address));
    }

    for (import, address) in &resolved {
        let at = import.patch_rva as usize;
        let slot = image.get_mut(at..at + 8).ok_or_else(|| {
            MapError::invalid(format!("import slot at {:#x} lies outside the image", import.patch_rva))
        })?;
        slot.copy_from_slice(&address.to_le_bytes());
    }

    if !resolved.is_empty() {
        log::info!("[Imports] resolved {} imports", resolved.len());
    }
    Ok(resolved.len())
}
