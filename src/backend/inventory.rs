//! Platform inventory files.
//!
//! An inventory describes platforms and devices in TOML so a [`HostRuntime`]
//! can stand in for hardware that is not present:
//!
//! ```toml
//! [[platform]]
//! name = "AMD Accelerated Parallel Processing"
//! vendor = "Advanced Micro Devices, Inc."
//!
//! [[platform.devices]]
//! name = "Tahiti"
//! vendor = "Advanced Micro Devices, Inc."
//! class = "accelerator"
//! max_clock_mhz = 925
//! compute_units = 32
//! global_mem_bytes = 3221225472
//! ```
//!
//! [`HostRuntime`]: super::HostRuntime

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::HostRuntime;
use crate::device::Platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default, rename = "platform")]
    pub platforms: Vec<Platform>,
}

impl Inventory {
    pub fn parse(content: &str) -> Result<Self> {
        let inventory: Self = toml::from_str(content).context("invalid platform inventory")?;
        Ok(inventory)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory file: {}", path.display()))?;
        let inventory = Self::parse(&content)
            .with_context(|| format!("failed to parse inventory file: {}", path.display()))?;
        info!(
            path = %path.display(),
            platforms = inventory.platforms.len(),
            devices = inventory.platforms.iter().map(|p| p.devices.len()).sum::<usize>(),
            "loaded platform inventory"
        );
        Ok(inventory)
    }

    pub fn into_runtime(self) -> HostRuntime {
        HostRuntime::with_platforms(self.platforms)
    }
}
