//! Manual kernel driver mapper
//!
//! Maps a native PE32+ driver image into kernel memory through the
//! allocate/read/write/invoke primitives of an already-privileged helper
//! driver, instead of the OS driver loader:
//!
//! 1. Parse and validate the image, lay it out by virtual address
//! 2. Acquire the helper driver and allocate kernel memory
//! 3. Apply base relocations, resolve imports, seed the security cookie
//! 4. Write the image and call its entry point once
//! 5. Optionally wipe the headers and free the memory, release the helper

pub mod bridge;
pub mod config;
pub mod cookie;
pub mod embed;
pub mod error;
pub mod image;
pub mod imports;
pub mod mapper;
pub mod reloc;
pub mod safety;

pub use bridge::{AllocationMode, HelperDriver, KernelAllocation, KernelBridge, NtStatus};
pub use config::LoaderConfig;
pub use error::{BridgeError, MapError, MapFailure};
pub use image::ImageDescriptor;
pub use mapper::{EntryCallback, MapOptions, Mapper, MappingResult, Phase};

/// Maps `bytes` through `helper` with the process-wide crash guard installed.
pub fn map_driver<H: HelperDriver>(
    helper: H,
    bytes: &[u8],
    options: MapOptions,
) -> Result<MappingResult, MapFailure> {
    safety::install();
    Mapper::new(helper).map(bytes, options)
}
