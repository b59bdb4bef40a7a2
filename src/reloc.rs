//! Base relocation applier
//!
//! Entries are applied in descriptor order (relocation block order, then entry
//! order inside a block). When an entry overflows its field, everything before
//! it stays applied and nothing from it onward is touched.

use crate::error::{MapError, Result};
use crate::image::{Relocation, RelocationKind};

/// Rebases `image` (laid out by virtual address) from `preferred_base` to
/// `actual_base`. Returns the number of entries rewritten.
pub fn apply(image: &mut [u8], relocations: &[Relocation], preferred_base: u64, actual_base: u64) -> Result<usize> {
    let delta = actual_base.wrapping_sub(preferred_base) as i64;
    if delta == 0 {
        log::debug!("[Reloc] image placed at its preferred base, nothing to do");
        return Ok(0);
    }

    for (index, reloc) in relocations.iter().enumerate() {
        let at = reloc.rva as usize;
        let overflow = || MapError::RelocationOverflow {
            index,
            rva: reloc.rva,
            width: reloc.kind.width(),
        };

        match reloc.kind {
            RelocationKind::HighLow => {
                let slot = field::<4>(image, at, index)?;
                let old = u32::from_le_bytes(*slot);
                let new = i64::from(old)
                    .checked_add(delta)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(overflow)?;
                *slot = new.to_le_bytes();
            }
            RelocationKind::Dir64 => {
                let slot = field::<8>(image, at, index)?;
                let old = u64::from_le_bytes(*slot);
                let new = old.checked_add_signed(delta).ok_or_else(overflow)?;
                *slot = new.to_le_bytes();
            }
        }
    }

    log::info!(
        "[Reloc] applied {} relocations (delta {}{:#x})",
        relocations.len(),
        if delta < 0 { "-" } else { "+" },
        delta.unsigned_abs()
    );
    Ok(relocations.len())
}

fn field<const N: usize>(image: &mut [u8], at: usize, index: usize) -> Result<&mut [u8; N]> {
    image
        .get_mut(at..at + N)
        .and_then(|s| <&mut [u8; N]>::try_from(s).ok())
        .ok_or_else(|| MapError::invalid(format!("relocation #{} at {:#x} lies outside the image", index, at)))
}
