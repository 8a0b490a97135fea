//! Rebuild Command
//!
//! Remounts a resource with a forced rebuild and reports the recount.

use anyhow::Result;
use console::style;
use ibp_core::{Reliability, ResourceConfig};
use ibp_storage::{MountOptions, RebuildMode};

/// Run rebuild command
pub fn run(config: ResourceConfig, mode: &str, truncate: bool, json: bool) -> Result<()> {
    let mode: RebuildMode = mode.parse()?;
    let opts = MountOptions::default()
        .with_rebuild(mode)
        .with_truncate_expiration(truncate);

    let res = super::mount(config, opts)?;
    let c = res.counters();
    res.unmount()?;

    if json {
        let out = serde_json::json!({
            "rid": res.rid(),
            "mode": mode.to_string(),
            "truncate": truncate,
            "n_allocs": c.n_allocs,
            "n_alias": c.n_alias,
            "used_soft": c.used(Reliability::Soft),
            "used_hard": c.used(Reliability::Hard),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{} Rebuilt resource {} ({})",
        style("✓").green(),
        style(res.rid()).cyan(),
        mode
    );
    println!("  Allocations: {}", style(c.n_allocs).cyan());
    println!("  Aliases:     {}", style(c.n_alias).cyan());
    println!(
        "  Soft used:   {}",
        style(super::format_bytes(c.used(Reliability::Soft))).cyan()
    );
    println!(
        "  Hard used:   {}",
        style(super::format_bytes(c.used(Reliability::Hard))).cyan()
    );

    Ok(())
}
