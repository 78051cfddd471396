use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use accelctl::backend::inventory::Inventory;
use accelctl::config::LogFormat;
use accelctl::{
    Control, ControlConfig, ContextOrigin, DeviceClassFilter, DeviceRuntime, DeviceSelector,
    HostRuntime, RunMode,
};

#[derive(Parser)]
#[command(
    name = "accelctl",
    about = "Accelerator device selection and buffer cache control",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $ACCELCTL_CONFIG, then /etc/accelctl/accelctl.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List platforms and, optionally, their devices
    Platforms {
        /// Include per-device details
        #[arg(long)]
        devices: bool,

        /// Device class to list: all, default, cpu, accelerator, other
        #[arg(long, default_value = "all")]
        class: DeviceClassFilter,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Read platforms from a TOML inventory instead of probing the host
        #[arg(long)]
        inventory: Option<PathBuf>,
    },

    /// Run device selection and report the chosen context
    Select {
        /// Preferred vendor substring (overrides config)
        #[arg(long)]
        vendor: Option<String>,

        #[arg(long)]
        inventory: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Show which backend an operation of the given size would run on
    Resolve {
        /// Element count of the operation
        #[arg(long)]
        size: usize,

        /// Run mode (overrides config)
        #[arg(long)]
        mode: Option<RunMode>,

        #[arg(long)]
        inventory: Option<PathBuf>,
    },
}

fn init_tracing(config: &ControlConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn runtime(inventory: Option<&Path>) -> Result<Arc<dyn DeviceRuntime>> {
    Ok(match inventory {
        Some(path) => Arc::new(Inventory::load(path)?.into_runtime()),
        None => Arc::new(HostRuntime::detect()),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ControlConfig::load(path)?,
        None => ControlConfig::load_or_default(),
    };
    init_tracing(&config);

    match cli.command {
        Commands::Platforms {
            devices,
            class,
            json,
            inventory,
        } => {
            let ctl = Control::new(&config, runtime(inventory.as_deref())?)?;
            if json {
                let listed: Vec<_> = ctl
                    .platforms()
                    .iter()
                    .cloned()
                    .map(|mut p| {
                        if devices {
                            p.devices.retain(|d| class.matches(d.class));
                        } else {
                            p.devices.clear();
                        }
                        p
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else if ctl.platforms().is_empty() {
                println!("No platforms found.");
            } else {
                ctl.print_platforms(devices, class)?;
            }
        }
        Commands::Select {
            vendor,
            inventory,
            json,
        } => {
            if let Some(vendor) = vendor {
                config.selection.preferred_vendor = vendor;
            }
            let ctl = Control::new(&config, runtime(inventory.as_deref())?)?;
            let ctx = ctl.current_context();

            let fallback = match ctx.origin() {
                ContextOrigin::Selected => None,
                ContextOrigin::PlatformDefault => Some(
                    DeviceSelector::new(config.selection.preferred_vendor.clone())
                        .pick_best(ctl.platforms())
                        .err()
                        .map(|reason| reason.to_string())
                        .unwrap_or_else(|| "channel creation failed".to_string()),
                ),
            };

            if json {
                let report = json!({
                    "context": ctx,
                    "fallback_reason": fallback,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match (&fallback, ctx.device()) {
                    (None, Some(dev)) => println!(
                        "Selected '{}' ({}, {} CUs @ {} MHz, {} MB) on {}",
                        dev.name,
                        dev.class,
                        dev.compute_units,
                        dev.max_clock_mhz,
                        dev.global_mem_bytes / 1024 / 1024,
                        ctx.platform_name()
                    ),
                    (_, device) => {
                        if let Some(reason) = &fallback {
                            println!("Using platform default: {reason}");
                        }
                        match device {
                            Some(dev) => println!("Default device: '{}' ({})", dev.name, dev.class),
                            None => println!("Default device: none"),
                        }
                    }
                }
            }
        }
        Commands::Resolve {
            size,
            mode,
            inventory,
        } => {
            if let Some(mode) = mode {
                config.dispatch.run_mode = mode;
            }
            let ctl = Control::new(&config, runtime(inventory.as_deref())?)?;
            let backend = ctl.resolve_mode(size);
            tracing::debug!(%size, mode = %ctl.run_mode(), %backend, "resolved backend");
            println!("{backend}");
        }
    }

    Ok(())
}
