//! Device runtime boundary: platform enumeration, submission channels and
//! raw device allocations.
//!
//! Everything behind [`DeviceRuntime`] is a black box to the broker. A runtime
//! may fail any call; the broker decides which failures are fatal.

pub mod host;
pub mod inventory;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{ChannelId, ExecutionContext};
use crate::device::{DeviceDescriptor, Platform};

pub use host::HostRuntime;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: u64 },

    #[error("allocation of {requested} bytes exceeds the device limit of {limit} bytes")]
    AllocationTooLarge { requested: usize, limit: u64 },

    #[error("invalid memory flags {flags:?}: {reason}")]
    InvalidFlags { flags: MemFlags, reason: &'static str },

    #[error("context {0} has no device to allocate on")]
    NoDevice(String),

    #[error("failed to create submission channel for '{device}': {reason}")]
    ChannelCreation { device: String, reason: String },

    #[error("platform enumeration failed: {0}")]
    Enumeration(String),

    #[error("access of {len} bytes at offset {offset} is outside a {capacity}-byte buffer")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

bitflags! {
    /// Allocation flags. Opaque to the cache; only the runtime interprets them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemFlags: u64 {
        const READ_WRITE     = 1 << 0;
        const WRITE_ONLY     = 1 << 1;
        const READ_ONLY      = 1 << 2;
        const USE_HOST_PTR   = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR  = 1 << 5;
    }
}

/// Identity of a host-side staging buffer.
///
/// Only the address is kept. It distinguishes cache entries and is never
/// dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPtr(usize);

impl HostPtr {
    pub fn from_addr(addr: usize) -> Self {
        HostPtr(addr)
    }

    /// Identity of the slice's first element.
    pub fn of<T>(slice: &[T]) -> Self {
        HostPtr(slice.as_ptr() as usize)
    }

    pub fn addr(&self) -> usize {
        self.0
    }
}

impl fmt::Display for HostPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A raw device allocation handed out by a runtime.
///
/// Implementations synchronise their own storage; the cache guarantees only
/// that one claimant at a time is handed the allocation.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Size in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the allocation starting at `offset`.
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), BackendError>;

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), BackendError>;
}

/// Shared reference to a runtime allocation.
pub type DeviceBuffer = Arc<dyn DeviceMemory>;

/// Boundary to a device runtime (an OpenCL-style driver stack, or the host).
pub trait DeviceRuntime: Send + Sync {
    /// Short human-readable runtime name for logs.
    fn name(&self) -> &str;

    /// Enumerate every platform and its devices.
    fn platforms(&self) -> Result<Vec<Platform>, BackendError>;

    /// The ambient default context, used whenever selection declines to pick.
    fn default_context(&self) -> ExecutionContext;

    /// Create a fresh submission channel for `device` on `platform`.
    fn create_channel(
        &self,
        platform: &Platform,
        device: &DeviceDescriptor,
    ) -> Result<ChannelId, BackendError>;

    /// Create a device allocation of exactly `size` bytes.
    fn allocate(
        &self,
        context: &ExecutionContext,
        size: usize,
        flags: MemFlags,
        host_ptr: Option<HostPtr>,
    ) -> Result<DeviceBuffer, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_ptr_identity() {
        let a = vec![0u32; 4];
        let b = vec![0u32; 4];
        assert_eq!(HostPtr::of(&a), HostPtr::of(&a[..]));
        assert_ne!(HostPtr::of(&a), HostPtr::of(&b));
    }

    #[test]
    fn test_mem_flags_are_hashable_keys() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(MemFlags::READ_ONLY);
        set.insert(MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR);
        set.insert(MemFlags::READ_ONLY);
        assert_eq!(set.len(), 2);
    }
}
