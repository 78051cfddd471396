//! In-process device runtime.
//!
//! Devices are either detected from the host (one CPU device on a host
//! platform) or supplied by the caller, e.g. from an inventory file. Every
//! allocation is a host byte buffer charged against the owning device's
//! global memory size, so exhaustion behaves like a real device running out
//! of memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{BackendError, DeviceBuffer, DeviceMemory, DeviceRuntime, HostPtr, MemFlags};
use crate::context::{ChannelId, ExecutionContext};
use crate::device::{DeviceClass, DeviceDescriptor, Platform};

/// Byte budget of one device.
#[derive(Debug)]
struct MemoryPool {
    capacity: u64,
    used: AtomicU64,
}

impl MemoryPool {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    fn reserve(&self, bytes: u64) -> Result<(), u64> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| self.capacity.saturating_sub(used))
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Host-backed device allocation.
#[derive(Debug)]
pub struct HostMemory {
    data: Mutex<Vec<u8>>,
    len: usize,
    pool: Arc<MemoryPool>,
}

impl HostMemory {
    fn check_range(&self, offset: usize, len: usize) -> Result<(), BackendError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BackendError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }
}

impl DeviceMemory for HostMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), BackendError> {
        self.check_range(offset, data.len())?;
        let mut buf = self.data.lock().unwrap_or_else(|e| e.into_inner());
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), BackendError> {
        self.check_range(offset, out.len())?;
        let buf = self.data.lock().unwrap_or_else(|e| e.into_inner());
        out.copy_from_slice(&buf[offset..offset + out.len()]);
        Ok(())
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.pool.release(self.len as u64);
    }
}

/// Device runtime living entirely in host memory.
pub struct HostRuntime {
    platforms: Vec<Platform>,
    pools: HashMap<String, Arc<MemoryPool>>,
    allocations: AtomicU64,
}

impl HostRuntime {
    /// Runtime exposing exactly the given platforms.
    pub fn with_platforms(platforms: Vec<Platform>) -> Self {
        let pools = platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .map(|d| (pool_key(d), Arc::new(MemoryPool::new(d.global_mem_bytes))))
            .collect();
        Self {
            platforms,
            pools,
            allocations: AtomicU64::new(0),
        }
    }

    /// Runtime with one host platform holding the detected CPU.
    pub fn detect() -> Self {
        let sys = sysinfo::System::new_all();
        let cpus = sys.cpus();
        let vendor = cpus
            .first()
            .map(|c| c.vendor_id().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "unknown".into());
        let brand = cpus
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "host cpu".into());
        let freq_mhz = cpus.first().map(|c| c.frequency()).unwrap_or(0);

        let mut cpu = DeviceDescriptor::new(
            brand,
            vendor.clone(),
            DeviceClass::Cpu,
            u32::try_from(freq_mhz).unwrap_or(u32::MAX),
            u32::try_from(cpus.len()).unwrap_or(u32::MAX),
            sys.total_memory(),
        );
        cpu.host_unified_memory = true;
        cpu.max_work_group_size = 1024;

        info!(
            device = %cpu.name,
            cores = cpu.compute_units,
            freq_mhz = cpu.max_clock_mhz,
            total_mb = cpu.global_mem_bytes / (1024 * 1024),
            "detected host device"
        );

        Self::with_platforms(vec![Platform::new("Host", vendor).with_device(cpu)])
    }

    /// Number of successful allocations made so far.
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated on `device`.
    pub fn bytes_in_use(&self, device: &DeviceDescriptor) -> u64 {
        self.pools
            .get(&pool_key(device))
            .map(|p| p.used.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

fn pool_key(device: &DeviceDescriptor) -> String {
    format!("{}/{}", device.vendor, device.name)
}

fn validate_flags(flags: MemFlags, host_ptr: Option<HostPtr>) -> Result<(), BackendError> {
    let access = flags & (MemFlags::READ_WRITE | MemFlags::WRITE_ONLY | MemFlags::READ_ONLY);
    if access.bits().count_ones() > 1 {
        return Err(BackendError::InvalidFlags {
            flags,
            reason: "more than one access qualifier",
        });
    }
    if flags.contains(MemFlags::USE_HOST_PTR)
        && flags.intersects(MemFlags::ALLOC_HOST_PTR | MemFlags::COPY_HOST_PTR)
    {
        return Err(BackendError::InvalidFlags {
            flags,
            reason: "USE_HOST_PTR excludes ALLOC_HOST_PTR and COPY_HOST_PTR",
        });
    }
    let wants_ptr = flags.intersects(MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR);
    match (wants_ptr, host_ptr.is_some()) {
        (true, false) => Err(BackendError::InvalidFlags {
            flags,
            reason: "host pointer flag without a host pointer",
        }),
        (false, true) => Err(BackendError::InvalidFlags {
            flags,
            reason: "host pointer supplied without USE_HOST_PTR or COPY_HOST_PTR",
        }),
        _ => Ok(()),
    }
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> Result<Vec<Platform>, BackendError> {
        Ok(self.platforms.clone())
    }

    fn default_context(&self) -> ExecutionContext {
        let first = self.platforms.first();
        let device = first.and_then(|p| p.devices.first()).cloned();
        let (name, vendor) = first
            .map(|p| (p.name.clone(), p.vendor.clone()))
            .unwrap_or_else(|| ("Host".into(), String::new()));
        ExecutionContext::platform_default(name, vendor, device, ChannelId::new())
    }

    fn create_channel(
        &self,
        platform: &Platform,
        device: &DeviceDescriptor,
    ) -> Result<ChannelId, BackendError> {
        if device.compute_units == 0 {
            return Err(BackendError::ChannelCreation {
                device: device.name.clone(),
                reason: "device reports no compute units".into(),
            });
        }
        let channel = ChannelId::new();
        debug!(platform = %platform.name, device = %device.name, %channel, "created submission channel");
        Ok(channel)
    }

    fn allocate(
        &self,
        context: &ExecutionContext,
        size: usize,
        flags: MemFlags,
        host_ptr: Option<HostPtr>,
    ) -> Result<DeviceBuffer, BackendError> {
        validate_flags(flags, host_ptr)?;

        let device = context
            .device()
            .ok_or_else(|| BackendError::NoDevice(context.id().to_string()))?;

        let limit = device.allocation_limit();
        if size as u64 > limit {
            return Err(BackendError::AllocationTooLarge {
                requested: size,
                limit,
            });
        }

        let pool = self
            .pools
            .get(&pool_key(device))
            .cloned()
            .unwrap_or_else(|| Arc::new(MemoryPool::new(device.global_mem_bytes)));
        pool.reserve(size as u64)
            .map_err(|available| BackendError::OutOfMemory {
                requested: size,
                available,
            })?;

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(HostMemory {
            data: Mutex::new(vec![0; size]),
            len: size,
            pool,
        }))
    }
}
