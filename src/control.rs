//! The control object: device selection, execution context, buffer cache and
//! dispatch settings in one place.
//!
//! Algorithms receive a `&Control` and ask it for scratch buffers and for the
//! backend path to run on. One Control may be shared by any number of
//! threads; settings that change the context or tuning take `&mut self`.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, DeviceRuntime, HostPtr, HostRuntime, MemFlags};
use crate::cache::{AllocationCache, AllocationHandle, CacheError, CacheStats, EntrySnapshot};
use crate::config::{ConfigError, ControlConfig};
use crate::context::{ExecutionContext, WaitMode};
use crate::device::{DeviceClassFilter, Platform};
use crate::diag;
use crate::mode::{ConcreteBackend, RunMode, RunModeController};
use crate::ops::AcceleratedOp;
use crate::select::DeviceSelector;

bitflags! {
    /// Diagnostic switches for collaborators and for [`Control::execute`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DebugFlags: u32 {
        /// Log each kernel compilation.
        const COMPILE             = 1 << 0;
        /// Dump generated kernel source.
        const SHOW_CODE           = 1 << 1;
        /// Keep compiler intermediates.
        const SAVE_COMPILER_TEMPS = 1 << 2;
        /// Cross-check non-serial results against the serial path.
        const DEBUG_KERNEL_RUN    = 1 << 3;
        const AUTO_TUNE           = 1 << 4;
    }
}

/// Compiler option added when [`DebugFlags::SAVE_COMPILER_TEMPS`] is set.
const SAVE_TEMPS_OPTION: &str = "-save-temps=accelctl";

pub struct Control {
    runtime: Arc<dyn DeviceRuntime>,
    selector: DeviceSelector,
    platforms: Vec<Platform>,
    context: ExecutionContext,
    cache: AllocationCache,
    run_mode: Arc<RunModeController>,
    wait_mode: WaitMode,
    debug: DebugFlags,
    wg_per_compute_unit: u32,
    use_host: bool,
    compile_options: String,
}

impl Control {
    /// Validate `config`, enumerate the runtime's platforms and bind the
    /// best device.
    ///
    /// Failing to find a suitable device is not an error; the runtime's
    /// default context is used instead.
    pub fn new(config: &ControlConfig, runtime: Arc<dyn DeviceRuntime>) -> Result<Self, ConfigError> {
        config.validate()?;

        let platforms = runtime.platforms().unwrap_or_else(|e| {
            warn!(runtime = runtime.name(), error = %e, "platform enumeration failed, assuming none");
            Vec::new()
        });

        let selector = DeviceSelector::new(config.selection.preferred_vendor.clone());
        let context = selector.select_best_device(&platforms, runtime.as_ref());
        let dispatch = &config.dispatch;

        info!(
            runtime = runtime.name(),
            platforms = platforms.len(),
            context = %context,
            origin = ?context.origin(),
            "control initialized"
        );

        Ok(Self {
            runtime,
            selector,
            platforms,
            context,
            cache: AllocationCache::new(),
            run_mode: Arc::new(RunModeController::new(dispatch.run_mode, dispatch.auto_threshold)),
            wait_mode: dispatch.wait_mode,
            debug: dispatch.debug,
            wg_per_compute_unit: dispatch.wg_per_compute_unit,
            use_host: dispatch.use_host,
            compile_options: dispatch.compile_options.clone(),
        })
    }

    /// Control over the detected host device with `config`.
    pub fn host(config: &ControlConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(HostRuntime::detect()))
    }

    /// Share a run-mode controller, e.g. [`RunModeController::global`],
    /// instead of this control's own.
    pub fn with_run_mode_controller(mut self, controller: Arc<RunModeController>) -> Self {
        self.run_mode = controller;
        self
    }

    // -- buffers -------------------------------------------------------------

    /// Claim a device buffer of at least `size` bytes on the current context.
    pub fn acquire_buffer(
        &self,
        size: usize,
        flags: MemFlags,
        host_ptr: Option<HostPtr>,
    ) -> Result<AllocationHandle, CacheError> {
        self.cache
            .acquire(self.runtime.as_ref(), &self.context, size, flags, host_ptr)
    }

    pub fn total_buffer_size(&self) -> usize {
        self.cache.total_bytes()
    }

    pub fn reset_buffers(&self) {
        self.cache.reset();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_snapshot(&self) -> Vec<EntrySnapshot> {
        self.cache.snapshot()
    }

    // -- context -------------------------------------------------------------

    pub fn current_context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Replace the current context. Cache entries of the old one are freed.
    pub fn set_context(&mut self, context: ExecutionContext) {
        if context.id() == self.context.id() {
            return;
        }
        let old = std::mem::replace(&mut self.context, context);
        let purged = self.cache.purge_context(old.id());
        info!(old = %old, new = %self.context, purged, "execution context replaced");
    }

    /// Run device selection again over the current platform snapshot.
    pub fn reselect(&mut self) -> &ExecutionContext {
        let context = self
            .selector
            .select_best_device(&self.platforms, self.runtime.as_ref());
        self.set_context(context);
        &self.context
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    /// Re-enumerate platforms. The current context is kept; call
    /// [`reselect`](Self::reselect) to pick again.
    pub fn refresh_platforms(&mut self) -> Result<(), BackendError> {
        self.platforms = self.runtime.platforms()?;
        debug!(platforms = self.platforms.len(), "platform snapshot refreshed");
        Ok(())
    }

    pub fn runtime(&self) -> &dyn DeviceRuntime {
        self.runtime.as_ref()
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    // -- run mode ------------------------------------------------------------

    pub fn run_mode(&self) -> RunMode {
        self.run_mode.mode()
    }

    pub fn set_run_mode(&self, mode: RunMode) {
        self.run_mode.set_mode(mode);
    }

    pub fn run_mode_controller(&self) -> &Arc<RunModeController> {
        &self.run_mode
    }

    /// Backend path for an operation over `size_hint` elements. The
    /// accelerator counts as available only if selection picked a device.
    pub fn resolve_mode(&self, size_hint: usize) -> ConcreteBackend {
        self.run_mode.resolve(size_hint, self.context.is_selected())
    }

    /// Run `op` on the backend path resolved for `size_hint`.
    ///
    /// With [`DebugFlags::DEBUG_KERNEL_RUN`] set, non-serial results are
    /// checked against the serial implementation and mismatches logged.
    pub fn execute<Op, Input, Output>(&self, op: &Op, input: &Input, size_hint: usize) -> Result<Output>
    where
        Op: AcceleratedOp<Input, Output>,
        Output: PartialEq + Debug,
    {
        let backend = self.resolve_mode(size_hint);
        debug!(%backend, size_hint, "dispatching operation");

        let result = match backend {
            ConcreteBackend::Accelerator => op.run_accelerator(input, self),
            ConcreteBackend::MultiCoreCpu => op.run_multicore(input),
            ConcreteBackend::SerialCpu => op.run_serial(input),
        }?;

        if self.debug.contains(DebugFlags::DEBUG_KERNEL_RUN) && backend != ConcreteBackend::SerialCpu {
            match op.run_serial(input) {
                Ok(reference) if reference != result => warn!(
                    %backend,
                    ?result,
                    ?reference,
                    "backend result differs from serial reference"
                ),
                Ok(_) => debug!(%backend, "backend result matches serial reference"),
                Err(e) => warn!(%backend, error = %e, "serial reference failed"),
            }
        }

        Ok(result)
    }

    // -- tuning --------------------------------------------------------------

    pub fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    pub fn set_wait_mode(&mut self, mode: WaitMode) {
        self.wait_mode = mode;
    }

    pub fn debug(&self) -> DebugFlags {
        self.debug
    }

    pub fn set_debug(&mut self, flags: DebugFlags) {
        self.debug = flags;
    }

    pub fn wg_per_compute_unit(&self) -> u32 {
        self.wg_per_compute_unit
    }

    /// Zero is rejected; the current value is kept.
    pub fn set_wg_per_compute_unit(&mut self, count: u32) -> Result<(), ConfigError> {
        if count == 0 {
            return Err(ConfigError::ZeroWorkGroups);
        }
        self.wg_per_compute_unit = count;
        Ok(())
    }

    pub fn use_host(&self) -> bool {
        self.use_host
    }

    pub fn set_use_host(&mut self, use_host: bool) {
        self.use_host = use_host;
    }

    pub fn compile_options(&self) -> &str {
        &self.compile_options
    }

    pub fn set_compile_options(&mut self, options: impl Into<String>) {
        self.compile_options = options.into();
    }

    /// Compile options with debug-flag additions applied.
    pub fn effective_compile_options(&self) -> String {
        let mut opts = self.compile_options.trim().to_string();
        if self.debug.contains(DebugFlags::SAVE_COMPILER_TEMPS) {
            if !opts.is_empty() {
                opts.push(' ');
            }
            opts.push_str(SAVE_TEMPS_OPTION);
        }
        opts
    }

    /// Total work-groups to launch on the current device.
    pub fn work_group_count(&self) -> u32 {
        let units = self
            .context
            .device()
            .map(|d| d.compute_units.max(1))
            .unwrap_or(1);
        units.saturating_mul(self.wg_per_compute_unit)
    }

    // -- diagnostics ---------------------------------------------------------

    /// Print the platform snapshot to stdout.
    pub fn print_platforms(&self, include_devices: bool, filter: DeviceClassFilter) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        diag::print_platforms(&mut out, &self.platforms, include_devices, filter)
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.cache.reset();
        debug!(context = %self.context, "control dropped, buffers released");
    }
}
