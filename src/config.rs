//! TOML configuration for a [`Control`](crate::control::Control).
//!
//! Every section is optional and falls back to compiled-in defaults. The
//! file is located through the `ACCELCTL_CONFIG` environment variable, then
//! the standard system location.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::WaitMode;
use crate::control::DebugFlags;
use crate::mode::{RunMode, DEFAULT_AUTO_THRESHOLD};
use crate::select::DEFAULT_PREFERRED_VENDOR;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ACCELCTL_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/accelctl/accelctl.toml";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("selection.preferred_vendor must not be empty")]
    EmptyPreferredVendor,

    #[error("dispatch.wg_per_compute_unit must be at least 1")]
    ZeroWorkGroups,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControlConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded control configuration");
        Ok(config)
    }

    /// Try `ACCELCTL_CONFIG`, then [`SYSTEM_CONFIG_PATH`], then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ACCELCTL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject settings no Control can be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.selection.preferred_vendor.trim().is_empty() {
            return Err(ConfigError::EmptyPreferredVendor);
        }
        if self.dispatch.wg_per_compute_unit == 0 {
            return Err(ConfigError::ZeroWorkGroups);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Substring matched against each platform's vendor string.
    pub preferred_vendor: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            preferred_vendor: DEFAULT_PREFERRED_VENDOR.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub run_mode: RunMode,
    /// Element count at which automatic mode stops using the serial path.
    pub auto_threshold: usize,
    pub wait_mode: WaitMode,
    pub wg_per_compute_unit: u32,
    /// Let collaborators run parts of an algorithm on the host CPU.
    pub use_host: bool,
    pub debug: DebugFlags,
    /// Extra options handed to the kernel compiler.
    pub compile_options: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Automatic,
            auto_threshold: DEFAULT_AUTO_THRESHOLD,
            wait_mode: WaitMode::Balanced,
            wg_per_compute_unit: 8,
            use_host: true,
            debug: DebugFlags::empty(),
            compile_options: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ControlConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.selection.preferred_vendor, DEFAULT_PREFERRED_VENDOR);
        assert_eq!(cfg.dispatch.wg_per_compute_unit, 8);
        assert_eq!(cfg.dispatch.run_mode, RunMode::Automatic);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: ControlConfig = toml::from_str(
            r#"
[dispatch]
run_mode = "multi-core-cpu"
wait_mode = "busy"
debug = "COMPILE | SAVE_COMPILER_TEMPS"
"#,
        )
        .unwrap();
        assert_eq!(cfg.dispatch.run_mode, RunMode::MultiCoreCpu);
        assert_eq!(cfg.dispatch.wait_mode, WaitMode::Busy);
        assert_eq!(
            cfg.dispatch.debug,
            DebugFlags::COMPILE | DebugFlags::SAVE_COMPILER_TEMPS
        );
        assert_eq!(cfg.dispatch.auto_threshold, DEFAULT_AUTO_THRESHOLD);
        assert_eq!(cfg.selection.preferred_vendor, DEFAULT_PREFERRED_VENDOR);
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_validate_rejects_blank_vendor() {
        let mut cfg = ControlConfig::default();
        cfg.selection.preferred_vendor = "   ".into();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyPreferredVendor));
    }

    #[test]
    fn test_validate_rejects_zero_work_groups() {
        let mut cfg = ControlConfig::default();
        cfg.dispatch.wg_per_compute_unit = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroWorkGroups));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[selection]\npreferred_vendor = \"Acme\"\n[logging]\nformat = \"json\"").unwrap();
        let cfg = ControlConfig::load(file.path()).unwrap();
        assert_eq!(cfg.selection.preferred_vendor, "Acme");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let err = ControlConfig::load(Path::new("/nonexistent/accelctl.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/accelctl.toml"));
    }
}
