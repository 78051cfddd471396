//! Allocation cache -- pooled device buffers with single-claim handles.
//!
//! Buffers are keyed by (context, flags, host pointer). A key may hold any
//! number of entries so several same-shaped buffers can be live at once.
//! [`AllocationCache::acquire`] reuses a free entry that is large enough,
//! replaces a free entry that is too small, and otherwise grows the pool. It
//! never waits for another claimant to let go.
//!
//! All entry state lives behind one mutex. The backend allocation runs while
//! that mutex is held, so an entry is only ever inserted once its buffer
//! exists.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{BackendError, DeviceBuffer, DeviceMemory, DeviceRuntime, HostPtr, MemFlags};
use crate::context::{ContextId, ExecutionContext};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("allocation size must be greater than zero")]
    ZeroSize,

    #[error("failed to allocate {size} bytes for {key}: {source}")]
    Allocation {
        size: usize,
        key: CacheKey,
        #[source]
        source: BackendError,
    },
}

/// Lookup key of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub context: ContextId,
    pub flags: MemFlags,
    pub host_ptr: Option<HostPtr>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} flags={:#x}", self.context, self.flags.bits())?;
        match self.host_ptr {
            Some(ptr) => write!(f, " host_ptr={ptr}"),
            None => f.write_str(" host_ptr=null"),
        }
    }
}

/// Stable identity of one cache entry for the lifetime of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(u64);

#[derive(Debug)]
struct Entry {
    id: EntryId,
    capacity: usize,
    in_use: bool,
    buffer: DeviceBuffer,
    allocated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Vec<Entry>>,
    next_id: u64,
    allocations: u64,
    reuses: u64,
    evictions: u64,
}

impl CacheState {
    fn release(&mut self, key: &CacheKey, id: EntryId) {
        // The entry is gone if the cache was reset or its context purged
        // while the handle was alive; nothing to release then.
        let Some(entry) = self
            .entries
            .get_mut(key)
            .and_then(|slots| slots.iter_mut().find(|e| e.id == id))
        else {
            return;
        };
        debug_assert!(entry.in_use, "released an entry that was not claimed");
        entry.in_use = false;
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    // Every mutation leaves the map consistent before anything that can
    // panic runs, so a poisoned lock still guards valid state.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Usage counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    /// Entries across all keys.
    pub entries: usize,
    /// Entries currently claimed by a live handle.
    pub in_use: usize,
    /// Sum of entry capacities.
    pub total_bytes: usize,
    /// Backend allocations performed.
    pub allocations: u64,
    /// Requests served from an existing entry.
    pub reuses: u64,
    /// Free entries discarded for being too small.
    pub evictions: u64,
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub key: CacheKey,
    pub capacity: usize,
    pub in_use: bool,
    pub allocated_at: DateTime<Utc>,
}

/// Thread-safe pool of device allocations.
#[derive(Debug, Default)]
pub struct AllocationCache {
    state: Arc<Mutex<CacheState>>,
}

impl AllocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a buffer of at least `size` bytes for `context`.
    ///
    /// The returned handle is the only claim on its entry until it is
    /// dropped. Backend failures are returned as-is and never retried.
    pub fn acquire(
        &self,
        runtime: &dyn DeviceRuntime,
        context: &ExecutionContext,
        size: usize,
        flags: MemFlags,
        host_ptr: Option<HostPtr>,
    ) -> Result<AllocationHandle, CacheError> {
        if size == 0 {
            return Err(CacheError::ZeroSize);
        }

        let key = CacheKey {
            context: context.id(),
            flags,
            host_ptr,
        };

        let mut guard = lock(&self.state);
        let state = &mut *guard;

        if let Some(slots) = state.entries.get_mut(&key) {
            if let Some(entry) = slots.iter_mut().find(|e| !e.in_use && e.capacity >= size) {
                entry.in_use = true;
                state.reuses += 1;
                debug!(%key, size, capacity = entry.capacity, entry = entry.id.0, "reusing cached buffer");
                return Ok(AllocationHandle {
                    state: Arc::clone(&self.state),
                    key,
                    id: entry.id,
                    requested: size,
                    buffer: Arc::clone(&entry.buffer),
                });
            }

            // No free entry fits. A free one that is too small would never
            // fit this key's larger requests, so it makes room for the new one.
            // The eviction stands even if the allocation below fails.
            if let Some(pos) = slots.iter().position(|e| !e.in_use) {
                let old = slots.remove(pos);
                state.evictions += 1;
                debug!(%key, size, capacity = old.capacity, entry = old.id.0, "evicting undersized buffer");
            }
        }

        let buffer = runtime
            .allocate(context, size, flags, host_ptr)
            .map_err(|source| CacheError::Allocation { size, key, source })?;

        let id = EntryId(state.next_id);
        state.next_id += 1;
        state.allocations += 1;
        debug!(%key, size, entry = id.0, runtime = runtime.name(), "allocated device buffer");

        state.entries.entry(key).or_default().push(Entry {
            id,
            capacity: size,
            in_use: true,
            buffer: Arc::clone(&buffer),
            allocated_at: Utc::now(),
        });

        Ok(AllocationHandle {
            state: Arc::clone(&self.state),
            key,
            id,
            requested: size,
            buffer,
        })
    }

    /// Sum of entry capacities.
    pub fn total_bytes(&self) -> usize {
        lock(&self.state)
            .entries
            .values()
            .flatten()
            .map(|e| e.capacity)
            .sum()
    }

    /// Drop every entry under every key.
    ///
    /// Live handles keep their buffer alive until they are dropped, but their
    /// entries are gone: the memory is not reused afterwards.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        let entries: usize = state.entries.values().map(Vec::len).sum();
        state.entries.clear();
        if entries > 0 {
            info!(entries, "allocation cache reset");
        }
    }

    /// Drop every entry keyed to `context`. Returns how many were removed.
    pub fn purge_context(&self, context: ContextId) -> usize {
        let mut state = lock(&self.state);
        let mut removed = 0;
        state.entries.retain(|key, slots| {
            if key.context == context {
                removed += slots.len();
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(%context, removed, "purged cache entries for context");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        let mut stats = CacheStats {
            allocations: state.allocations,
            reuses: state.reuses,
            evictions: state.evictions,
            ..CacheStats::default()
        };
        for entry in state.entries.values().flatten() {
            stats.entries += 1;
            stats.total_bytes += entry.capacity;
            if entry.in_use {
                stats.in_use += 1;
            }
        }
        stats
    }

    /// Every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let state = lock(&self.state);
        let mut out: Vec<_> = state
            .entries
            .iter()
            .flat_map(|(key, slots)| {
                slots.iter().map(move |e| EntrySnapshot {
                    id: e.id,
                    key: *key,
                    capacity: e.capacity,
                    in_use: e.in_use,
                    allocated_at: e.allocated_at,
                })
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }
}

/// Exclusive claim on one cache entry.
///
/// Dropping the handle marks the entry free again; the buffer itself stays
/// in the cache for the next claimant. Handles cannot be cloned, so an entry
/// is released exactly once per claim.
pub struct AllocationHandle {
    state: Arc<Mutex<CacheState>>,
    key: CacheKey,
    id: EntryId,
    requested: usize,
    buffer: DeviceBuffer,
}

impl AllocationHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn entry_id(&self) -> EntryId {
        self.id
    }

    /// Bytes the caller asked for. The buffer may be larger.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Size of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &dyn DeviceMemory {
        self.buffer.as_ref()
    }
}

impl Deref for AllocationHandle {
    type Target = dyn DeviceMemory;

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref()
    }
}

impl fmt::Debug for AllocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("requested", &self.requested)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}

impl Drop for AllocationHandle {
    fn drop(&mut self) {
        lock(&self.state).release(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostRuntime;
    use crate::device::{DeviceClass, DeviceDescriptor, Platform};

    fn setup() -> (HostRuntime, ExecutionContext) {
        let rt = HostRuntime::with_platforms(vec![Platform::new("Acme CL", "Acme").with_device(
            DeviceDescriptor::new("g0", "Acme", DeviceClass::Accelerator, 1000, 4, 1 << 20),
        )]);
        let ctx = rt.default_context();
        (rt, ctx)
    }

    #[test]
    fn test_first_acquire_allocates_exact_size() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        let h = cache.acquire(&rt, &ctx, 1024, MemFlags::READ_ONLY, None).unwrap();
        assert_eq!(h.capacity(), 1024);
        assert_eq!(cache.total_bytes(), 1024);
        assert_eq!(cache.stats().in_use, 1);
    }

    #[test]
    fn test_release_then_smaller_request_reuses() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();

        let first = cache.acquire(&rt, &ctx, 1024, MemFlags::READ_ONLY, None).unwrap();
        let id = first.entry_id();
        drop(first);

        let second = cache.acquire(&rt, &ctx, 512, MemFlags::READ_ONLY, None).unwrap();
        assert_eq!(second.entry_id(), id);
        assert_eq!(second.requested(), 512);
        assert_eq!(second.capacity(), 1024);
        assert_eq!(cache.total_bytes(), 1024);
        assert_eq!(rt.allocation_count(), 1);
        assert_eq!(cache.stats().reuses, 1);
    }

    #[test]
    fn test_undersized_free_entry_is_replaced() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();

        drop(cache.acquire(&rt, &ctx, 1024, MemFlags::READ_ONLY, None).unwrap());
        let big = cache.acquire(&rt, &ctx, 2048, MemFlags::READ_ONLY, None).unwrap();

        assert_eq!(big.capacity(), 2048);
        assert_eq!(cache.total_bytes(), 2048);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_in_use_entry_is_never_shared() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();

        let a = cache.acquire(&rt, &ctx, 256, MemFlags::READ_WRITE, None).unwrap();
        let b = cache.acquire(&rt, &ctx, 128, MemFlags::READ_WRITE, None).unwrap();
        assert_ne!(a.entry_id(), b.entry_id());
        assert_eq!(cache.total_bytes(), 384);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_fitting_entry_preferred_over_eviction() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();

        let small = cache.acquire(&rt, &ctx, 100, MemFlags::READ_WRITE, None).unwrap();
        let large = cache.acquire(&rt, &ctx, 1000, MemFlags::READ_WRITE, None).unwrap();
        let large_id = large.entry_id();
        drop(small);
        drop(large);

        let h = cache.acquire(&rt, &ctx, 500, MemFlags::READ_WRITE, None).unwrap();
        assert_eq!(h.entry_id(), large_id);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.total_bytes(), 1100);
    }

    #[test]
    fn test_flags_and_host_ptr_discriminate() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        let staging_a = vec![0u8; 64];
        let staging_b = vec![0u8; 64];
        let f = MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR;

        let a = cache.acquire(&rt, &ctx, 64, f, Some(HostPtr::of(&staging_a))).unwrap();
        let a_id = a.entry_id();
        drop(a);
        let b = cache.acquire(&rt, &ctx, 64, f, Some(HostPtr::of(&staging_b))).unwrap();
        assert_ne!(b.entry_id(), a_id);
        drop(b);

        let ro = cache.acquire(&rt, &ctx, 64, MemFlags::READ_ONLY, None).unwrap();
        let ro_id = ro.entry_id();
        drop(ro);
        let wo = cache.acquire(&rt, &ctx, 64, MemFlags::WRITE_ONLY, None).unwrap();
        assert_ne!(wo.entry_id(), ro_id);
        assert_eq!(cache.stats().entries, 4);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        assert!(matches!(
            cache.acquire(&rt, &ctx, 0, MemFlags::empty(), None),
            Err(CacheError::ZeroSize)
        ));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_failed_allocation_leaves_no_entry() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        let err = cache
            .acquire(&rt, &ctx, 2 << 20, MemFlags::READ_WRITE, None)
            .unwrap_err();
        match err {
            CacheError::Allocation { size, key, .. } => {
                assert_eq!(size, 2 << 20);
                assert_eq!(key.context, ctx.id());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_eviction_stands_when_replacement_fails() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        drop(cache.acquire(&rt, &ctx, 1024, MemFlags::READ_WRITE, None).unwrap());
        assert_eq!(cache.total_bytes(), 1024);

        let err = cache.acquire(&rt, &ctx, 2 << 20, MemFlags::READ_WRITE, None);
        assert!(matches!(err, Err(CacheError::Allocation { .. })));

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        drop(cache.acquire(&rt, &ctx, 64, MemFlags::empty(), None).unwrap());
        cache.reset();
        assert_eq!(cache.total_bytes(), 0);
        cache.reset();
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_handle_outliving_reset_is_harmless() {
        let (rt, ctx) = setup();
        let cache = AllocationCache::new();
        let h = cache.acquire(&rt, &ctx, 64, MemFlags::empty(), None).unwrap();
        cache.reset();
        h.write(0, &[7; 8]).unwrap();
        drop(h);
        assert_eq!(cache.stats().entries, 0);
        let dev = ctx.device().unwrap();
        assert_eq!(rt.bytes_in_use(dev), 0);
    }

    #[test]
    fn test_purge_context_only_touches_that_context() {
        let (rt, ctx) = setup();
        let other = rt.default_context();
        let cache = AllocationCache::new();
        drop(cache.acquire(&rt, &ctx, 64, MemFlags::empty(), None).unwrap());
        drop(cache.acquire(&rt, &other, 32, MemFlags::empty(), None).unwrap());

        assert_eq!(cache.purge_context(ctx.id()), 1);
        assert_eq!(cache.total_bytes(), 32);
        let snap = cache.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key.context, other.id());
    }
}
