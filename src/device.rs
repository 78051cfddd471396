//! Device and platform descriptors.
//!
//! A [`DeviceDescriptor`] is an immutable snapshot of one execution device's
//! capabilities, taken when the platforms were enumerated. Descriptors are
//! never mutated; a fresh enumeration replaces them wholesale.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Broad class of an execution device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    /// The runtime's default device, class otherwise unknown.
    Default,
    /// A host CPU exposed as a compute device.
    Cpu,
    /// A GPU-style accelerator.
    Accelerator,
    Other,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Default => "default",
            DeviceClass::Cpu => "CPU",
            DeviceClass::Accelerator => "Accelerator",
            DeviceClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// Which device classes a platform listing should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClassFilter {
    #[default]
    All,
    Only(DeviceClass),
}

impl DeviceClassFilter {
    pub fn matches(&self, class: DeviceClass) -> bool {
        match self {
            DeviceClassFilter::All => true,
            DeviceClassFilter::Only(wanted) => *wanted == class,
        }
    }
}

impl FromStr for DeviceClassFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(DeviceClassFilter::All),
            "default" => Ok(DeviceClassFilter::Only(DeviceClass::Default)),
            "cpu" => Ok(DeviceClassFilter::Only(DeviceClass::Cpu)),
            "accelerator" | "gpu" => Ok(DeviceClassFilter::Only(DeviceClass::Accelerator)),
            "other" => Ok(DeviceClassFilter::Only(DeviceClass::Other)),
            other => Err(format!(
                "unknown device class '{other}' (expected all, default, cpu, accelerator or other)"
            )),
        }
    }
}

/// Kind of memory backing a device's local (work-group shared) storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalMemType {
    /// Dedicated on-chip local memory.
    #[default]
    Local,
    /// Local memory emulated in global memory.
    Global,
    None,
}

impl fmt::Display for LocalMemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocalMemType::Local => "local",
            LocalMemType::Global => "global",
            LocalMemType::None => "none",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of one device's capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub vendor: String,
    pub class: DeviceClass,
    /// Maximum clock frequency in MHz.
    pub max_clock_mhz: u32,
    pub compute_units: u32,
    /// Global memory size in bytes.
    pub global_mem_bytes: u64,
    /// Largest single allocation the device accepts, in bytes.
    #[serde(default)]
    pub max_mem_alloc_bytes: u64,
    #[serde(default)]
    pub local_mem_bytes: u64,
    #[serde(default)]
    pub local_mem_type: LocalMemType,
    #[serde(default)]
    pub max_work_group_size: usize,
    #[serde(default)]
    pub host_unified_memory: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub driver_version: String,
    #[serde(default)]
    pub extensions: BTreeSet<String>,
}

impl DeviceDescriptor {
    /// Minimal descriptor; the remaining capabilities take neutral defaults.
    pub fn new(
        name: impl Into<String>,
        vendor: impl Into<String>,
        class: DeviceClass,
        max_clock_mhz: u32,
        compute_units: u32,
        global_mem_bytes: u64,
    ) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            class,
            max_clock_mhz,
            compute_units,
            global_mem_bytes,
            max_mem_alloc_bytes: global_mem_bytes,
            local_mem_bytes: 0,
            local_mem_type: LocalMemType::default(),
            max_work_group_size: 0,
            host_unified_memory: false,
            version: String::new(),
            driver_version: String::new(),
            extensions: BTreeSet::new(),
        }
    }

    /// Clock rate times compute units, the selection heuristic's score.
    ///
    /// Computed in 64 bits so large devices cannot wrap.
    pub fn work_potential(&self) -> u64 {
        u64::from(self.max_clock_mhz) * u64::from(self.compute_units)
    }

    /// Largest allocation this device accepts. Falls back to the global
    /// memory size when the per-allocation limit was not reported.
    pub fn allocation_limit(&self) -> u64 {
        if self.max_mem_alloc_bytes == 0 {
            self.global_mem_bytes
        } else {
            self.max_mem_alloc_bytes
        }
    }
}

/// One platform (driver/vendor stack) and the devices it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub extensions: BTreeSet<String>,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl Platform {
    pub fn new(name: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            version: String::new(),
            profile: String::new(),
            extensions: BTreeSet::new(),
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: DeviceDescriptor) -> Self {
        self.devices.push(device);
        self
    }

    /// Devices of this platform matching `filter`, in enumeration order.
    pub fn devices_matching(
        &self,
        filter: DeviceClassFilter,
    ) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().filter(move |d| filter.matches(d.class))
    }
}

/// Split a space-separated extension string as drivers report it.
pub fn parse_extensions(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_potential_does_not_wrap() {
        let d = DeviceDescriptor::new("big", "Acme", DeviceClass::Accelerator, u32::MAX, 4, 1);
        assert_eq!(d.work_potential(), u64::from(u32::MAX) * 4);
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!("all".parse::<DeviceClassFilter>(), Ok(DeviceClassFilter::All));
        assert_eq!(
            "GPU".parse::<DeviceClassFilter>(),
            Ok(DeviceClassFilter::Only(DeviceClass::Accelerator))
        );
        assert!("fpga".parse::<DeviceClassFilter>().is_err());
    }

    #[test]
    fn test_devices_matching_keeps_order() {
        let p = Platform::new("p", "Acme")
            .with_device(DeviceDescriptor::new("c0", "Acme", DeviceClass::Cpu, 1, 1, 1))
            .with_device(DeviceDescriptor::new("g0", "Acme", DeviceClass::Accelerator, 1, 1, 1))
            .with_device(DeviceDescriptor::new("g1", "Acme", DeviceClass::Accelerator, 1, 1, 1));
        let names: Vec<_> = p
            .devices_matching(DeviceClassFilter::Only(DeviceClass::Accelerator))
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, ["g0", "g1"]);
    }

    #[test]
    fn test_parse_extensions() {
        let ext = parse_extensions("cl_khr_fp64  cl_khr_icd\tcl_amd_printf ");
        assert_eq!(ext.len(), 3);
        assert!(ext.contains("cl_khr_icd"));
    }

    #[test]
    fn test_allocation_limit_fallback() {
        let mut d = DeviceDescriptor::new("g", "Acme", DeviceClass::Accelerator, 1, 1, 4096);
        d.max_mem_alloc_bytes = 0;
        assert_eq!(d.allocation_limit(), 4096);
        d.max_mem_alloc_bytes = 1024;
        assert_eq!(d.allocation_limit(), 1024);
    }
}
