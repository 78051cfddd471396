//! Execution contexts: a device paired with a command submission channel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceDescriptor;

/// Identity of an execution context. Part of every allocation cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        ContextId(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0.simple())
    }
}

/// Opaque identifier of a command submission channel (a command queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        ChannelId(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0.simple())
    }
}

/// How a context came to be current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextOrigin {
    /// Picked by the device selector.
    Selected,
    /// The runtime's ambient default; no selection was made.
    PlatformDefault,
}

/// A device plus the submission channel work for it is queued on.
///
/// Contexts are replaced, never mutated. Cloning shares the same identity,
/// so a clone keys into the same cache entries as the original.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    id: ContextId,
    platform_name: String,
    platform_vendor: String,
    device: Option<Arc<DeviceDescriptor>>,
    channel: ChannelId,
    origin: ContextOrigin,
}

impl ExecutionContext {
    /// Context bound to a device the selector picked.
    pub fn selected(
        platform_name: impl Into<String>,
        platform_vendor: impl Into<String>,
        device: DeviceDescriptor,
        channel: ChannelId,
    ) -> Self {
        Self {
            id: ContextId::new(),
            platform_name: platform_name.into(),
            platform_vendor: platform_vendor.into(),
            device: Some(Arc::new(device)),
            channel,
            origin: ContextOrigin::Selected,
        }
    }

    /// The runtime's ambient default context. `device` is `None` when the
    /// runtime exposes no device at all.
    pub fn platform_default(
        platform_name: impl Into<String>,
        platform_vendor: impl Into<String>,
        device: Option<DeviceDescriptor>,
        channel: ChannelId,
    ) -> Self {
        Self {
            id: ContextId::new(),
            platform_name: platform_name.into(),
            platform_vendor: platform_vendor.into(),
            device: device.map(Arc::new),
            channel,
            origin: ContextOrigin::PlatformDefault,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn origin(&self) -> ContextOrigin {
        self.origin
    }

    pub fn is_selected(&self) -> bool {
        self.origin == ContextOrigin::Selected
    }

    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.as_deref()
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn platform_vendor(&self) -> &str {
        &self.platform_vendor
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(dev) => write!(
                f,
                "{} on '{}' ({}, {}) via {}",
                self.id, dev.name, dev.class, self.platform_vendor, self.channel
            ),
            None => write!(f, "{} (no device) via {}", self.id, self.channel),
        }
    }
}

/// How callers wait for work submitted on a context's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitMode {
    /// Flush and spin on completion status.
    Busy,
    /// Block on the completion event, yielding the thread.
    Nice,
    /// Block on the completion event.
    #[default]
    Balanced,
    /// Drain the whole channel.
    Finish,
}

impl FromStr for WaitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "busy" => Ok(WaitMode::Busy),
            "nice" => Ok(WaitMode::Nice),
            "balanced" => Ok(WaitMode::Balanced),
            "finish" => Ok(WaitMode::Finish),
            other => Err(format!("unknown wait mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;

    #[test]
    fn test_clone_keeps_identity() {
        let dev = DeviceDescriptor::new("g", "Acme", DeviceClass::Accelerator, 1000, 4, 1 << 20);
        let ctx = ExecutionContext::selected("Acme CL", "Acme", dev, ChannelId::new());
        let copy = ctx.clone();
        assert_eq!(ctx.id(), copy.id());
        assert!(copy.is_selected());
    }

    #[test]
    fn test_fresh_contexts_are_distinct() {
        let a = ExecutionContext::platform_default("p", "v", None, ChannelId::new());
        let b = ExecutionContext::platform_default("p", "v", None, ChannelId::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.origin(), ContextOrigin::PlatformDefault);
        assert!(a.device().is_none());
    }

    #[test]
    fn test_wait_mode_parse() {
        assert_eq!("Finish".parse::<WaitMode>(), Ok(WaitMode::Finish));
        assert!("sleepy".parse::<WaitMode>().is_err());
        assert_eq!(WaitMode::default(), WaitMode::Balanced);
    }
}
