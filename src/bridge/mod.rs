//! Kernel primitive bridge
//!
//! Every touch of kernel memory goes through [`KernelBridge`]. A bridge only
//! exists after [`HelperDriver::acquire`] succeeded; the helper driver behind
//! it is the privileged component whose exposed operations provide the
//! allocate/read/write/invoke primitives.

mod exports;
pub mod simulated;

pub use exports::{ExportLookup, ExportTable, ModuleExports};

use crate::error::BridgeError;
use crate::image::SectionProtection;
use crate::safety::ReleaseAction;

/// Kernel status code returned by an invoked routine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NtStatus(pub i32);

impl NtStatus {
    pub const SUCCESS: NtStatus = NtStatus(0);
    pub const UNSUCCESSFUL: NtStatus = NtStatus(0xC000_0001_u32 as i32);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}

/// Where and how kernel memory is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocationMode {
    /// Non-paged pool allocation.
    #[default]
    Pool,
    /// Physically contiguous memory.
    Contiguous,
    /// Independent pages; section protections are applied after the write.
    IndependentPages,
}

impl AllocationMode {
    pub fn name(self) -> &'static str {
        match self {
            AllocationMode::Pool => "pool",
            AllocationMode::Contiguous => "contiguous",
            AllocationMode::IndependentPages => "independent_pages",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pool" => Some(AllocationMode::Pool),
            "contiguous" => Some(AllocationMode::Contiguous),
            "independent_pages" => Some(AllocationMode::IndependentPages),
            _ => None,
        }
    }

    /// None of the strategies can ask the kernel for a specific address.
    pub fn guarantees_preferred_base(self) -> bool {
        false
    }

    pub fn applies_section_protection(self) -> bool {
        self == AllocationMode::IndependentPages
    }
}

/// Memory reserved in kernel address space. A zero base means the allocation
/// is not (or no longer) live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelAllocation {
    pub base: u64,
    pub size: usize,
    pub mode: AllocationMode,
}

impl KernelAllocation {
    pub fn is_live(&self) -> bool {
        self.base != 0
    }

    /// Marks the allocation released; returns the base it had.
    pub fn take_base(&mut self) -> u64 {
        std::mem::replace(&mut self.base, 0)
    }
}

pub trait KernelBridge: ExportLookup {
    fn allocate(&mut self, size: usize, mode: AllocationMode) -> Result<KernelAllocation, BridgeError>;

    /// Releases `allocation` and zeroes its base. Freeing a zero or already
    /// freed allocation succeeds without doing anything.
    fn free(&mut self, allocation: &mut KernelAllocation) -> Result<(), BridgeError>;

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), BridgeError>;

    fn read(&mut self, address: u64, len: usize) -> Result<Vec<u8>, BridgeError>;

    /// Calls the routine at `address` with two arguments and returns its
    /// status.
    fn invoke(&mut self, address: u64, arg1: u64, arg2: u64) -> Result<NtStatus, BridgeError>;

    fn protect(&mut self, _address: u64, _size: usize, _protection: SectionProtection) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Lifecycle of the privileged helper driver.
pub trait HelperDriver {
    type Bridge: KernelBridge;

    fn acquire(&mut self) -> Result<Self::Bridge, BridgeError>;

    /// Unloads the helper driver. Releasing twice is not an error.
    fn release(&mut self) -> Result<(), BridgeError>;

    /// Standalone release routine for the crash guard. It must not depend on
    /// the bridge still working.
    fn fault_release(&self) -> Option<ReleaseAction> {
        None
    }
}
