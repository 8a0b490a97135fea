//! Mkfs Command
//!
//! Formats a directory resource and writes its config file.

use anyhow::{bail, Context, Result};
use console::style;
use ibp_core::ResourceConfig;
use ibp_storage::{AllocationStore, DirDevice, Resource};
use std::path::PathBuf;
use tracing::info;

/// Mkfs configuration
pub struct MkfsConfig {
    pub rid: String,
    pub device: PathBuf,
    pub size_mb: u64,
    pub minfree_mb: Option<u64>,
    /// Where to write the config; defaults to `<device>/resource.toml`
    pub config_path: Option<PathBuf>,
    pub force: bool,
}

/// Run mkfs command
pub fn run(config: MkfsConfig) -> Result<()> {
    let config_path = config
        .config_path
        .clone()
        .unwrap_or_else(|| config.device.join("resource.toml"));
    if config_path.exists() && !config.force {
        bail!(
            "{} already exists; use --force to reformat",
            config_path.display()
        );
    }

    let resource = build_config(&config);

    let device = DirDevice::open(&resource.device)
        .with_context(|| format!("failed to open device {}", resource.device.display()))?;
    let store = AllocationStore::open(resource.device.join("db"))?;
    Resource::mkfs(&resource, &device, &store)?;
    drop(store);

    std::fs::write(&config_path, resource.to_toml()?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    info!(rid = %resource.rid, config = %config_path.display(), "Wrote resource config");

    println!(
        "{} Formatted resource {} at {}",
        style("✓").green(),
        style(&resource.rid).cyan(),
        resource.device.display()
    );
    println!(
        "  Quota:    {}",
        style(super::format_bytes(resource.limits().max_total)).cyan()
    );
    println!(
        "  Min free: {}",
        style(super::format_bytes(resource.limits().minfree)).cyan()
    );
    println!("  Config:   {}", config_path.display());

    Ok(())
}

fn build_config(config: &MkfsConfig) -> ResourceConfig {
    let mut resource = ResourceConfig::for_mkfs(&config.rid, &config.device, config.size_mb);
    if let Some(mb) = config.minfree_mb {
        resource.minfree_mb = mb;
    }
    resource
}
