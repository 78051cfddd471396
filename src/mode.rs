//! Run-mode control: which backend path services an operation.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Element count at which automatic mode leaves the CPU by default.
pub const DEFAULT_AUTO_THRESHOLD: usize = 4096;

/// Requested execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Decide per call from the operation size.
    #[default]
    Automatic,
    SerialCpu,
    MultiCoreCpu,
    Accelerator,
}

impl RunMode {
    const fn to_u8(self) -> u8 {
        match self {
            RunMode::Automatic => 0,
            RunMode::SerialCpu => 1,
            RunMode::MultiCoreCpu => 2,
            RunMode::Accelerator => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RunMode::SerialCpu,
            2 => RunMode::MultiCoreCpu,
            3 => RunMode::Accelerator,
            _ => RunMode::Automatic,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::Automatic => "automatic",
            RunMode::SerialCpu => "serial-cpu",
            RunMode::MultiCoreCpu => "multi-core-cpu",
            RunMode::Accelerator => "accelerator",
        };
        f.write_str(s)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "automatic" | "auto" => Ok(RunMode::Automatic),
            "serial-cpu" | "serial" => Ok(RunMode::SerialCpu),
            "multi-core-cpu" | "multicore" => Ok(RunMode::MultiCoreCpu),
            "accelerator" | "gpu" => Ok(RunMode::Accelerator),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

/// Backend path that actually executes an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcreteBackend {
    SerialCpu,
    MultiCoreCpu,
    Accelerator,
}

impl fmt::Display for ConcreteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConcreteBackend::SerialCpu => "serial-cpu",
            ConcreteBackend::MultiCoreCpu => "multi-core-cpu",
            ConcreteBackend::Accelerator => "accelerator",
        };
        f.write_str(s)
    }
}

/// Resolve `mode` for an operation of `size_hint` elements.
///
/// An explicit mode is returned as-is. Automatic mode keeps small operations
/// on the serial path, and sends larger ones to the accelerator when one was
/// selected, else to the multi-core path.
pub fn resolve_mode(
    mode: RunMode,
    size_hint: usize,
    threshold: usize,
    accelerator_available: bool,
) -> ConcreteBackend {
    match mode {
        RunMode::SerialCpu => ConcreteBackend::SerialCpu,
        RunMode::MultiCoreCpu => ConcreteBackend::MultiCoreCpu,
        RunMode::Accelerator => ConcreteBackend::Accelerator,
        RunMode::Automatic if size_hint < threshold => ConcreteBackend::SerialCpu,
        RunMode::Automatic if accelerator_available => ConcreteBackend::Accelerator,
        RunMode::Automatic => ConcreteBackend::MultiCoreCpu,
    }
}

/// Atomic run-mode cell plus the automatic-mode threshold.
///
/// Reads see the latest `set_mode` with no snapshotting, so a change applies
/// to the very next resolution.
#[derive(Debug)]
pub struct RunModeController {
    mode: AtomicU8,
    auto_threshold: AtomicUsize,
}

impl RunModeController {
    pub const fn new(mode: RunMode, auto_threshold: usize) -> Self {
        Self {
            mode: AtomicU8::new(mode.to_u8()),
            auto_threshold: AtomicUsize::new(auto_threshold),
        }
    }

    /// The process-wide controller. Starts in [`RunMode::Automatic`].
    pub fn global() -> Arc<RunModeController> {
        static GLOBAL: OnceLock<Arc<RunModeController>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(RunModeController::default())))
    }

    pub fn mode(&self) -> RunMode {
        RunMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: RunMode) {
        let previous = RunMode::from_u8(self.mode.swap(mode.to_u8(), Ordering::AcqRel));
        if previous != mode {
            debug!(%previous, current = %mode, "run mode changed");
        }
    }

    pub fn auto_threshold(&self) -> usize {
        self.auto_threshold.load(Ordering::Acquire)
    }

    pub fn set_auto_threshold(&self, threshold: usize) {
        self.auto_threshold.store(threshold, Ordering::Release);
    }

    pub fn resolve(&self, size_hint: usize, accelerator_available: bool) -> ConcreteBackend {
        resolve_mode(
            self.mode(),
            size_hint,
            self.auto_threshold(),
            accelerator_available,
        )
    }
}

impl Default for RunModeController {
    fn default() -> Self {
        Self::new(RunMode::Automatic, DEFAULT_AUTO_THRESHOLD)
    }
}
