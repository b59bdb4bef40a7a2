//! Error types for the mapping engine

use thiserror::Error;

use crate::mapper::{MappingResult, Phase};

/// Failure reported by a single bridge primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BridgeError {
    message: String,
}

impl BridgeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("image has no relocation table and cannot be placed at its preferred base")]
    NotRelocatable,

    #[error("kernel allocation of {size:#x} bytes failed: {source}")]
    AllocationFailure {
        size: usize,
        #[source]
        source: BridgeError,
    },

    #[error("helper driver unavailable: {0}")]
    BridgeUnavailable(#[source] BridgeError),

    #[error("write of {len:#x} bytes at {address:#x} failed: {source}")]
    WriteFailure {
        address: u64,
        len: usize,
        #[source]
        source: BridgeError,
    },

    #[error("read of {len:#x} bytes at {address:#x} failed: {source}")]
    ReadFailure {
        address: u64,
        len: usize,
        #[source]
        source: BridgeError,
    },

    #[error("relocation #{index} at rva {rva:#x} overflows its {width}-bit field")]
    RelocationOverflow { index: usize, rva: u32, width: u32 },

    #[error("unresolved import {module}!{symbol}")]
    UnresolvedImport { module: String, symbol: String },

    #[error("transfer of control to {address:#x} failed: {source}")]
    InvocationFailure {
        address: u64,
        #[source]
        source: BridgeError,
    },

    #[error("freeing kernel allocation at {address:#x} failed: {source}")]
    FreeFailure {
        address: u64,
        #[source]
        source: BridgeError,
    },
}

impl MapError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        MapError::InvalidImage(reason.into())
    }
}

/// A failed mapping: the error plus the last lifecycle phase that completed.
#[derive(Debug, Error)]
#[error("mapping failed after {completed:?}: {error}")]
pub struct MapFailure {
    pub completed: Phase,
    #[source]
    pub error: MapError,
    /// Set once the entry point has run: the image is live at `base` and
    /// returned `entry_status`, even though cleanup failed.
    pub mapped: Option<MappingResult>,
}

pub type Result<T, E = MapError> = std::result::Result<T, E>;
