//! Security cookie initialisation
//!
//! The kernel loader normally seeds the `/GS` cookie of every driver it
//! loads. A manually mapped image still holds the linker's placeholder, and
//! code built with stack protection bug-checks when it sees it. This runs
//! after relocation, so the cookie VA in the load-config directory already
//! points into the allocation.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MapError, Result};
use crate::image::{pe, ImageDescriptor};

pub const DEFAULT_SECURITY_COOKIE: u64 = 0x2B99_2DDF_A232;

const SECURITY_COOKIE_OFFSET: usize = 0x58;
const COOKIE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Replaces a placeholder cookie with a fresh one. Returns whether the image
/// was modified.
pub fn fix_security_cookie(image: &mut [u8], descriptor: &ImageDescriptor, actual_base: u64) -> Result<bool> {
    let Some(dir) = descriptor.load_config else {
        return Ok(false);
    };
    if (dir.size as usize) < SECURITY_COOKIE_OFFSET + 8 {
        log::debug!("[Cookie] load config too small for a security cookie");
        return Ok(false);
    }

    let cookie_va = pe::read_u64(image, dir.virtual_address as usize + SECURITY_COOKIE_OFFSET)?;
    if cookie_va == 0 {
        return Ok(false);
    }

    let cookie_rva = cookie_va
        .checked_sub(actual_base)
        .filter(|rva| rva + 8 <= image.len() as u64)
        .ok_or_else(|| MapError::invalid(format!("security cookie at {:#x} lies outside the image", cookie_va)))?
        as usize;

    let current = pe::read_u64(image, cookie_rva)?;
    if current != DEFAULT_SECURITY_COOKIE {
        log::debug!("[Cookie] cookie already initialised, leaving it");
        return Ok(false);
    }

    let cookie = new_cookie(actual_base, seed());
    image[cookie_rva..cookie_rva + 8].copy_from_slice(&cookie.to_le_bytes());
    log::info!("[Cookie] security cookie at rva {:#x} initialised", cookie_rva);
    Ok(true)
}

fn seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ (u64::from(std::process::id()) << 16)
}

fn new_cookie(base: u64, seed: u64) -> u64 {
    let mut cookie = (base ^ seed ^ (seed >> 29)) & COOKIE_MASK;
    if cookie == DEFAULT_SECURITY_COOKIE || cookie == 0 {
        cookie = (DEFAULT_SECURITY_COOKIE + 1) & COOKIE_MASK;
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testimage::TestImage;
    use crate::reloc;

    fn staged(image: &[u8], actual: u64) -> (ImageDescriptor, Vec<u8>) {
        let desc = ImageDescriptor::parse(image).unwrap();
        let mut staged = desc.lay_out(image).unwrap();
        reloc::apply(&mut staged, &desc.relocations, desc.preferred_base, actual).unwrap();
        (desc, staged)
    }

    fn cookie_rva(desc: &ImageDescriptor, staged: &[u8], actual: u64) -> usize {
        let lc = desc.load_config.unwrap().virtual_address as usize;
        (pe::read_u64(staged, lc + SECURITY_COOKIE_OFFSET).unwrap() - actual) as usize
    }

    #[test]
    fn test_placeholder_cookie_is_replaced() {
        let actual = TestImage::BASE + 0x10_0000;
        let (desc, mut image) = staged(&TestImage::minimal().security_cookie().build(), actual);
        let rva = cookie_rva(&desc, &image, actual);
        assert_eq!(pe::read_u64(&image, rva).unwrap(), DEFAULT_SECURITY_COOKIE);

        assert!(fix_security_cookie(&mut image, &desc, actual).unwrap());
        let cookie = pe::read_u64(&image, rva).unwrap();
        assert_ne!(cookie, DEFAULT_SECURITY_COOKIE);
        assert_eq!(cookie & !COOKIE_MASK, 0);
    }

    #[test]
    fn test_initialised_cookie_is_kept() {
        let actual = TestImage::BASE;
        let (desc, mut image) = staged(&TestImage::minimal().security_cookie().build(), actual);
        let rva = cookie_rva(&desc, &image, actual);
        image[rva..rva + 8].copy_from_slice(&0x1234u64.to_le_bytes());

        assert!(!fix_security_cookie(&mut image, &desc, actual).unwrap());
        assert_eq!(pe::read_u64(&image, rva).unwrap(), 0x1234);
    }

    #[test]
    fn test_image_without_load_config() {
        let (desc, mut image) = staged(&TestImage::minimal().build(), TestImage::BASE);
        let before = image.clone();
        assert!(!fix_security_cookie(&mut image, &desc, TestImage::BASE).unwrap());
        assert_eq!(image, before);
    }

    #[test]
    fn test_cookie_outside_image_is_invalid() {
        // Skipping relocation leaves the cookie VA pointing at the preferred base.
        let bytes = TestImage::minimal().security_cookie().build();
        let desc = ImageDescriptor::parse(&bytes).unwrap();
        let mut image = desc.lay_out(&bytes).unwrap();
        let err = fix_security_cookie(&mut image, &desc, TestImage::BASE + 0x100_0000).unwrap_err();
        assert!(matches!(err, MapError::InvalidImage(_)));
    }

    #[test]
    fn test_new_cookie_avoids_placeholder() {
        let base = DEFAULT_SECURITY_COOKIE;
        assert_ne!(new_cookie(base, 0), DEFAULT_SECURITY_COOKIE);
        assert_ne!(new_cookie(0, 0), 0);
    }
}
