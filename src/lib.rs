//! accelctl -- device selection, execution contexts and a device buffer
//! cache for accelerated algorithms.
//!
//! A [`Control`] binds one execution context to the best available device,
//! hands out cached scratch buffers through move-only handles, and decides
//! per call whether an operation runs serially, across CPU cores, or on the
//! accelerator.

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod control;
pub mod device;
pub mod diag;
pub mod mode;
pub mod ops;
pub mod select;

pub use backend::{BackendError, DeviceRuntime, HostPtr, HostRuntime, MemFlags};
pub use cache::{AllocationCache, AllocationHandle, CacheError, CacheKey, CacheStats};
pub use config::{ConfigError, ControlConfig};
pub use context::{ContextOrigin, ExecutionContext, WaitMode};
pub use control::{Control, DebugFlags};
pub use device::{DeviceClass, DeviceClassFilter, DeviceDescriptor, Platform};
pub use mode::{ConcreteBackend, RunMode, RunModeController};
pub use ops::AcceleratedOp;
pub use select::DeviceSelector;
