//! Mapping orchestrator
//!
//! Sequences one mapping: validate → acquire helper → allocate → fix up the
//! staging image → write → invoke the entry point → cleanup → release.
//! Nothing is retried; the first failing step ends the mapping and is reported
//! together with the last phase that completed.

use crate::bridge::{AllocationMode, HelperDriver, KernelAllocation, KernelBridge, NtStatus};
use crate::cookie;
use crate::error::{BridgeError, MapError, MapFailure, Result};
use crate::image::ImageDescriptor;
use crate::imports;
use crate::reloc;
use crate::safety::{self, SafetyNet};

/// Lifecycle of a mapping session, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    BridgeAcquired,
    Allocated,
    /// Relocations, imports and the security cookie applied to the staging
    /// image.
    FixedUp,
    /// Staging image transferred into kernel memory.
    ImageWritten,
    EntryInvoked,
    Cleaned,
    Failed,
}

/// Alternate way to reach the entry point, used instead of
/// [`KernelBridge::invoke`]. Receives the bridge, the entry address and both
/// arguments.
pub type EntryCallback = Box<dyn FnMut(&mut dyn KernelBridge, u64, u64, u64) -> Result<NtStatus, BridgeError>>;

pub struct MapOptions {
    /// Free the kernel allocation once the entry point returns.
    pub free_after_entry: bool,
    /// Zero the headers in kernel memory after the entry point returns.
    pub destroy_headers: bool,
    pub allocation_mode: AllocationMode,
    /// Pass the mapped base as the first entry argument instead of `param1`.
    pub pass_allocation_address: bool,
    pub param1: u64,
    pub param2: u64,
    pub entry_callback: Option<EntryCallback>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            free_after_entry: false,
            destroy_headers: true,
            allocation_mode: AllocationMode::Pool,
            pass_allocation_address: false,
            param1: 0,
            param2: 0,
            entry_callback: None,
        }
    }
}

impl std::fmt::Debug for MapOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapOptions")
            .field("free_after_entry", &self.free_after_entry)
            .field("destroy_headers", &self.destroy_headers)
            .field("allocation_mode", &self.allocation_mode)
            .field("pass_allocation_address", &self.pass_allocation_address)
            .field("param1", &self.param1)
            .field("param2", &self.param2)
            .field("entry_callback", &self.entry_callback.is_some())
            .finish()
    }
}

/// Outcome of a successful mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingResult {
    /// Kernel address the image was mapped at. Still reported when the
    /// allocation was freed after entry.
    pub base: u64,
    /// Status returned by the entry point, whatever its value.
    pub entry_status: NtStatus,
    pub freed: bool,
}

/// Transient state of one mapping.
struct MappingSession {
    descriptor: ImageDescriptor,
    staged: Vec<u8>,
    allocation: Option<KernelAllocation>,
    /// Known once the entry point has returned.
    entered: Option<MappingResult>,
    phase: Phase,
}

impl MappingSession {
    fn fail(&self, error: MapError) -> MapFailure {
        log::error!("[Mapper] failed after {:?}: {}", self.phase, error);
        if let Some(live) = self.entered {
            log::warn!(
                "[Mapper] image still live at {:#x}, entry returned {}",
                live.base,
                live.entry_status
            );
        }
        MapFailure { completed: self.phase, error, mapped: self.entered }
    }
}

pub struct Mapper<H: HelperDriver> {
    helper: H,
    net: &'static SafetyNet,
    phase: Phase,
}

impl<H: HelperDriver> Mapper<H> {
    pub fn new(helper: H) -> Self {
        Self::with_safety_net(helper, safety::global())
    }

    pub fn with_safety_net(helper: H, net: &'static SafetyNet) -> Self {
        Self { helper, net, phase: Phase::Idle }
    }

    /// Where the last mapping ended: `Cleaned`, `Failed`, or `Idle` when the
    /// image was rejected before the helper was touched.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn helper(&self) -> &H {
        &self.helper
    }

    pub fn into_helper(self) -> H {
        self.helper
    }

    /// Maps `bytes` into the kernel and runs its entry point.
    pub fn map(&mut self, bytes: &[u8], mut options: MapOptions) -> Result<MappingResult, MapFailure> {
        log::info!("[Mapper] mapping driver ({} bytes)...", bytes.len());

        self.phase = Phase::Idle;
        let mut session = prepare(bytes, &options).map_err(|error| {
            log::error!("[Mapper] rejected image: {}", error);
            MapFailure { completed: Phase::Idle, error, mapped: None }
        })?;

        let mut bridge = match self.helper.acquire() {
            Ok(bridge) => bridge,
            Err(source) => {
                let failure = session.fail(MapError::BridgeUnavailable(source));
                // A failed acquire may have left the service half-installed.
                self.release_helper();
                self.phase = Phase::Failed;
                return Err(failure);
            }
        };
        if let Some(action) = self.helper.fault_release() {
            self.net.arm(action);
        }
        session.phase = Phase::BridgeAcquired;

        let outcome = run(&mut bridge, &mut session, &mut options);
        if outcome.is_err() {
            abandon(&mut bridge, &mut session);
        }
        drop(bridge);

        self.release_helper();
        self.net.disarm();

        let result = outcome.map_err(|error| {
            self.phase = Phase::Failed;
            session.fail(error)
        })?;

        self.phase = Phase::Cleaned;
        log::info!(
            "[Mapper] driver mapped at {:#x}, entry returned {}",
            result.base,
            result.entry_status
        );
        Ok(result)
    }

    fn release_helper(&mut self) {
        if let Err(e) = self.helper.release() {
            log::warn!("[Mapper] warning: failed to fully unload helper driver: {}", e);
        }
    }
}

/// Everything that can be checked without touching the kernel.
fn prepare(bytes: &[u8], options: &MapOptions) -> Result<MappingSession> {
    if bytes.is_empty() {
        return Err(MapError::invalid("empty driver buffer"));
    }

    let descriptor = ImageDescriptor::parse(bytes)?;
    descriptor.ensure_relocatable(options.allocation_mode.guarantees_preferred_base())?;
    let staged = descriptor.lay_out(bytes)?;

    log::info!("[Mapper] image size: {:#x}", descriptor.size_of_image);
    log::info!("[Mapper] entry rva: {:#x}", descriptor.entry_point);
    log::info!("[Mapper] preferred base: {:#x}", descriptor.preferred_base);

    Ok(MappingSession { descriptor, staged, allocation: None, entered: None, phase: Phase::Idle })
}

fn run<B: KernelBridge>(bridge: &mut B, session: &mut MappingSession, options: &mut MapOptions) -> Result<MappingResult> {
    let size = session.descriptor.size_of_image as usize;
    let allocation = bridge
        .allocate(size, options.allocation_mode)
        .map_err(|source| MapError::AllocationFailure { size, source })?;
    let base = allocation.base;
    session.allocation = Some(allocation);
    session.phase = Phase::Allocated;
    log::info!("[Mapper] allocated {:#x} bytes at {:#x} ({})", size, base, options.allocation_mode.name());

    let desc = &session.descriptor;
    reloc::apply(&mut session.staged, &desc.relocations, desc.preferred_base, base)?;
    imports::resolve(&mut session.staged, &desc.imports, bridge)?;
    cookie::fix_security_cookie(&mut session.staged, desc, base)?;
    session.phase = Phase::FixedUp;

    write(bridge, base, &session.staged)?;
    if options.allocation_mode.applies_section_protection() {
        for section in &desc.sections {
            let address = base + section.virtual_address as u64;
            bridge
                .protect(address, section.mapped_size() as usize, section.protection)
                .map_err(|source| MapError::WriteFailure { address, len: section.mapped_size() as usize, source })?;
        }
    }
    session.phase = Phase::ImageWritten;

    let entry = base + desc.entry_point as u64;
    let arg1 = if options.pass_allocation_address { base } else { options.param1 };
    let arg2 = options.param2;
    log::info!("[Mapper] calling entry point at {:#x}", entry);
    let invoked = match options.entry_callback.as_mut() {
        Some(callback) => callback(bridge, entry, arg1, arg2),
        None => bridge.invoke(entry, arg1, arg2),
    };
    let entry_status = invoked.map_err(|source| MapError::InvocationFailure { address: entry, source })?;
    session.phase = Phase::EntryInvoked;
    session.entered = Some(MappingResult { base, entry_status, freed: false });
    log::info!("[Mapper] entry point returned {}", entry_status);

    // The entry status is data from the mapped image; cleanup runs either way.
    if options.destroy_headers {
        let zeros = vec![0u8; desc.size_of_headers as usize];
        write(bridge, base, &zeros)?;
        log::debug!("[Mapper] headers destroyed");
    }

    let mut freed = false;
    if options.free_after_entry {
        if let Some(allocation) = session.allocation.as_mut() {
            bridge
                .free(allocation)
                .map_err(|source| MapError::FreeFailure { address: base, source })?;
            freed = true;
            log::info!("[Mapper] memory freed");
        }
    }

    Ok(MappingResult { base, entry_status, freed })
}

/// Best-effort release of an allocation whose image never ran.
fn abandon<B: KernelBridge>(bridge: &mut B, session: &mut MappingSession) {
    if session.phase >= Phase::EntryInvoked {
        return;
    }
    if let Some(allocation) = session.allocation.as_mut() {
        let base = allocation.base;
        match bridge.free(allocation) {
            Ok(()) => log::info!("[Mapper] released allocation at {:#x}", base),
            Err(e) => log::warn!("[Mapper] could not release allocation at {:#x}: {}", base, e),
        }
    }
}

fn write<B: KernelBridge>(bridge: &mut B, address: u64, bytes: &[u8]) -> Result<()> {
    bridge
        .write(address, bytes)
        .map_err(|source| MapError::WriteFailure { address, len: bytes.len(), source })
}
