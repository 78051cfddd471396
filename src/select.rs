//! Device selection.
//!
//! Picks the accelerator with the highest work potential among the
//! preferred vendor's platforms. Declining to pick is not an error: the
//! caller gets the runtime's ambient default context instead.

use std::fmt;

use tracing::{debug, info, warn};

use crate::backend::DeviceRuntime;
use crate::context::ExecutionContext;
use crate::device::{DeviceClass, DeviceDescriptor, Platform};

/// Vendor string of the platform stack the selector prefers by default.
pub const DEFAULT_PREFERRED_VENDOR: &str = "Advanced Micro Devices, Inc.";

/// Why the selector fell back to the ambient default context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    NoPlatforms,
    NoPreferredVendor { vendor: String },
    NoAcceleratorDevices,
    ChannelUnavailable { device: String, error: String },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoPlatforms => f.write_str("no platforms available"),
            FallbackReason::NoPreferredVendor { vendor } => {
                write!(f, "no platform from vendor '{vendor}'")
            }
            FallbackReason::NoAcceleratorDevices => {
                f.write_str("preferred platforms expose no accelerator devices")
            }
            FallbackReason::ChannelUnavailable { device, error } => {
                write!(f, "could not open a channel on '{device}': {error}")
            }
        }
    }
}

/// Chooses the device an execution context is bound to.
#[derive(Debug, Clone)]
pub struct DeviceSelector {
    preferred_vendor: String,
}

impl DeviceSelector {
    pub fn new(preferred_vendor: impl Into<String>) -> Self {
        Self {
            preferred_vendor: preferred_vendor.into(),
        }
    }

    pub fn preferred_vendor(&self) -> &str {
        &self.preferred_vendor
    }

    fn is_preferred(&self, platform: &Platform) -> bool {
        platform.vendor.contains(&self.preferred_vendor)
    }

    /// Best accelerator among the preferred vendor's platforms.
    ///
    /// Highest work potential wins; ties go to the larger global memory, and
    /// a full tie keeps the device enumerated first. A device only wins if it
    /// beats the empty `(0, 0)` score, so devices reporting neither work
    /// potential nor memory are never chosen.
    pub fn pick_best<'a>(
        &self,
        platforms: &'a [Platform],
    ) -> Result<(&'a Platform, &'a DeviceDescriptor), FallbackReason> {
        if platforms.is_empty() {
            return Err(FallbackReason::NoPlatforms);
        }

        let mut preferred = platforms.iter().filter(|p| self.is_preferred(p)).peekable();
        if preferred.peek().is_none() {
            return Err(FallbackReason::NoPreferredVendor {
                vendor: self.preferred_vendor.clone(),
            });
        }

        let mut best: Option<(&Platform, &DeviceDescriptor)> = None;
        let (mut best_potential, mut best_mem) = (0u64, 0u64);

        for platform in preferred {
            let accelerators = platform
                .devices
                .iter()
                .filter(|d| d.class == DeviceClass::Accelerator);

            for device in accelerators {
                let potential = device.work_potential();
                let wins = potential > best_potential
                    || (potential == best_potential && device.global_mem_bytes > best_mem);
                if wins {
                    best = Some((platform, device));
                    best_potential = potential;
                    best_mem = device.global_mem_bytes;
                }
            }
        }

        best.ok_or(FallbackReason::NoAcceleratorDevices)
    }

    /// Bind a new execution context to the best device, or hand back the
    /// runtime's default context when none qualifies. Never fails.
    pub fn select_best_device(
        &self,
        platforms: &[Platform],
        runtime: &dyn DeviceRuntime,
    ) -> ExecutionContext {
        match self.try_select(platforms, runtime) {
            Ok(ctx) => ctx,
            Err(reason) => {
                info!(%reason, runtime = runtime.name(), "device selection fell back to platform default");
                runtime.default_context()
            }
        }
    }

    fn try_select(
        &self,
        platforms: &[Platform],
        runtime: &dyn DeviceRuntime,
    ) -> Result<ExecutionContext, FallbackReason> {
        let (platform, device) = self.pick_best(platforms)?;
        debug!(
            platform = %platform.name,
            device = %device.name,
            work_potential = device.work_potential(),
            global_mem_bytes = device.global_mem_bytes,
            "selected device"
        );

        let channel = runtime.create_channel(platform, device).map_err(|e| {
            warn!(device = %device.name, error = %e, "submission channel creation failed");
            FallbackReason::ChannelUnavailable {
                device: device.name.clone(),
                error: e.to_string(),
            }
        })?;

        Ok(ExecutionContext::selected(
            platform.name.clone(),
            platform.vendor.clone(),
            device.clone(),
            channel,
        ))
    }
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::new(DEFAULT_PREFERRED_VENDOR)
    }
}
