//! In-memory kernel
//!
//! A [`SimulatedKernel`] stands in for the helper driver and the kernel
//! address space behind it. It records every primitive call and can be told to
//! fail any of them, which is how the mapper's failure handling is exercised
//! without a privileged driver. The dry-run binary maps into it as well.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AllocationMode, ExportLookup, ExportTable, HelperDriver, KernelAllocation, KernelBridge, ModuleExports, NtStatus};
use crate::error::BridgeError;
use crate::image::{ImportName, SectionProtection};
use crate::safety::ReleaseAction;

const PAGE_SIZE: u64 = 0x1000;
const DEFAULT_ALLOCATION_BASE: u64 = 0xFFFF_A000_0000_0000;
const SYNTHETIC_EXPORT_BASE: u64 = 0xFFFF_F806_0000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub address: u64,
    pub arg1: u64,
    pub arg2: u64,
}

#[derive(Debug, Default)]
struct Failures {
    acquire: bool,
    allocate: bool,
    /// Number of writes that succeed before every further write fails.
    writes_before_failure: Option<usize>,
    invoke: bool,
    free: bool,
    release: bool,
}

#[derive(Debug)]
struct State {
    memory: BTreeMap<u64, Vec<u8>>,
    next_base: u64,
    exports: ExportTable,
    synthetic_exports: bool,
    next_synthetic: u64,
    entry_status: NtStatus,
    loaded: bool,
    acquire_calls: usize,
    release_calls: usize,
    fault_releases: usize,
    allocations: Vec<KernelAllocation>,
    frees: Vec<u64>,
    writes: Vec<(u64, usize)>,
    invocations: Vec<Invocation>,
    protections: Vec<(u64, usize, SectionProtection)>,
    fail: Failures,
}

impl State {
    fn region_mut(&mut self, address: u64, len: usize) -> Option<&mut [u8]> {
        let (&base, region) = self.memory.range_mut(..=address).next_back()?;
        let start = (address - base) as usize;
        let end = start.checked_add(len)?;
        region.get_mut(start..end)
    }
}

/// Shared handle on the simulated kernel; clones observe the same state.
#[derive(Clone, Debug)]
pub struct SimulatedKernel {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                memory: BTreeMap::new(),
                next_base: DEFAULT_ALLOCATION_BASE,
                exports: ExportTable::new(),
                synthetic_exports: false,
                next_synthetic: SYNTHETIC_EXPORT_BASE,
                entry_status: NtStatus::SUCCESS,
                loaded: false,
                acquire_calls: 0,
                release_calls: 0,
                fault_releases: 0,
                allocations: Vec::new(),
                frees: Vec::new(),
                writes: Vec::new(),
                invocations: Vec::new(),
                protections: Vec::new(),
                fail: Failures::default(),
            })),
        }
    }

    pub fn helper(&self) -> SimulatedHelper {
        SimulatedHelper { state: Arc::clone(&self.state) }
    }

    // ---- configuration ----

    /// Address handed out by the next allocation.
    pub fn with_allocation_base(self, base: u64) -> Self {
        self.state.lock().next_base = base;
        self
    }

    pub fn with_entry_status(self, status: NtStatus) -> Self {
        self.state.lock().entry_status = status;
        self
    }

    pub fn with_module(self, name: &str, exports: ModuleExports) -> Self {
        self.state.lock().exports.add_module(name, exports);
        self
    }

    /// Resolve every import to a made-up kernel address.
    pub fn with_synthetic_exports(self) -> Self {
        self.state.lock().synthetic_exports = true;
        self
    }

    pub fn fail_acquire(self) -> Self {
        self.state.lock().fail.acquire = true;
        self
    }

    pub fn fail_allocate(self) -> Self {
        self.state.lock().fail.allocate = true;
        self
    }

    pub fn fail_writes_after(self, successful: usize) -> Self {
        self.state.lock().fail.writes_before_failure = Some(successful);
        self
    }

    pub fn fail_invoke(self) -> Self {
        self.state.lock().fail.invoke = true;
        self
    }

    pub fn fail_free(self) -> Self {
        self.state.lock().fail.free = true;
        self
    }

    pub fn fail_release(self) -> Self {
        self.state.lock().fail.release = true;
        self
    }

    // ---- inspection ----

    pub fn memory(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        self.state.lock().region_mut(address, len).map(|r| r.to_vec())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn acquire_calls(&self) -> usize {
        self.state.lock().acquire_calls
    }

    pub fn release_calls(&self) -> usize {
        self.state.lock().release_calls
    }

    pub fn fault_releases(&self) -> usize {
        self.state.lock().fault_releases
    }

    pub fn allocations(&self) -> Vec<KernelAllocation> {
        self.state.lock().allocations.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn frees(&self) -> Vec<u64> {
        self.state.lock().frees.clone()
    }

    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.state.lock().writes.clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    pub fn protections(&self) -> Vec<(u64, usize, SectionProtection)> {
        self.state.lock().protections.clone()
    }
}

#[derive(Debug)]
pub struct SimulatedHelper {
    state: Arc<Mutex<State>>,
}

impl HelperDriver for SimulatedHelper {
    type Bridge = SimulatedBridge;

    fn acquire(&mut self) -> Result<SimulatedBridge, BridgeError> {
        let mut state = self.state.lock();
        state.acquire_calls += 1;
        if state.fail.acquire {
            return Err(BridgeError::new("helper driver refused to load"));
        }
        state.loaded = true;
        Ok(SimulatedBridge { state: Arc::clone(&self.state) })
    }

    fn release(&mut self) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        state.release_calls += 1;
        if state.fail.release {
            return Err(BridgeError::new("helper driver refused to unload"));
        }
        state.loaded = false;
        Ok(())
    }

    fn fault_release(&self) -> Option<ReleaseAction> {
        let state = Arc::clone(&self.state);
        Some(Box::new(move || {
            if let Some(mut state) = state.try_lock() {
                state.fault_releases += 1;
                state.loaded = false;
            }
        }))
    }
}

#[derive(Debug)]
pub struct SimulatedBridge {
    state: Arc<Mutex<State>>,
}

impl ExportLookup for SimulatedBridge {
    fn lookup(&mut self, module: &str, symbol: &ImportName) -> Option<u64> {
        let mut state = self.state.lock();
        if let Some(address) = state.exports.lookup(module, symbol) {
            return Some(address);
        }
        if !state.synthetic_exports {
            return None;
        }

        let address = state.next_synthetic;
        state.next_synthetic += 0x10;
        let exports = state.exports.module_mut(module);
        match symbol {
            ImportName::Name(name) => exports.insert(name.clone(), None, address),
            ImportName::Ordinal(ordinal) => exports.insert_ordinal(*ordinal, address),
        }
        Some(address)
    }
}

impl KernelBridge for SimulatedBridge {
    fn allocate(&mut self, size: usize, mode: AllocationMode) -> Result<KernelAllocation, BridgeError> {
        let mut state = self.state.lock();
        if state.fail.allocate || size == 0 {
            return Err(BridgeError::new(format!("no {} memory for {:#x} bytes", mode.name(), size)));
        }

        let base = state.next_base;
        let span = (size as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        state.next_base = base + span + PAGE_SIZE;
        state.memory.insert(base, vec![0u8; size]);

        let allocation = KernelAllocation { base, size, mode };
        state.allocations.push(allocation.clone());
        Ok(allocation)
    }

    fn free(&mut self, allocation: &mut KernelAllocation) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if !allocation.is_live() || !state.memory.contains_key(&allocation.base) {
            allocation.take_base();
            return Ok(());
        }
        if state.fail.free {
            return Err(BridgeError::new(format!("free of {:#x} rejected", allocation.base)));
        }

        let base = allocation.take_base();
        state.memory.remove(&base);
        state.frees.push(base);
        Ok(())
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.fail.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(BridgeError::new(format!("write at {:#x} rejected", address)));
            }
            *remaining -= 1;
        }

        let region = state
            .region_mut(address, bytes.len())
            .ok_or_else(|| BridgeError::new(format!("{:#x} (+{:#x}) is not mapped", address, bytes.len())))?;
        region.copy_from_slice(bytes);
        state.writes.push((address, bytes.len()));
        Ok(())
    }

    fn read(&mut self, address: u64, len: usize) -> Result<Vec<u8>, BridgeError> {
        let mut state = self.state.lock();
        state
            .region_mut(address, len)
            .map(|r| r.to_vec())
            .ok_or_else(|| BridgeError::new(format!("{:#x} (+{:#x}) is not mapped", address, len)))
    }

    fn invoke(&mut self, address: u64, arg1: u64, arg2: u64) -> Result<NtStatus, BridgeError> {
        let mut state = self.state.lock();
        if state.fail.invoke {
            return Err(BridgeError::new("call trampoline could not be installed"));
        }
        if state.region_mut(address, 1).is_none() {
            return Err(BridgeError::new(format!("{:#x} is not mapped", address)));
        }
        state.invocations.push(Invocation { address, arg1, arg2 });
        Ok(state.entry_status)
    }

    fn protect(&mut self, address: u64, size: usize, protection: SectionProtection) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if state.region_mut(address, size).is_none() {
            return Err(BridgeError::new(format!("{:#x} (+{:#x}) is not mapped", address, size)));
        }
        state.protections.push((address, size, protection));
        Ok(())
    }
}
