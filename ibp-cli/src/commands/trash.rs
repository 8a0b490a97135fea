//! Trash Commands
//!
//! List trash bins and recover allocations from them.

use super::{format_bytes, format_time};
use anyhow::Result;
use console::style;
use ibp_core::ResourceConfig;
use ibp_storage::{MountOptions, TrashKind};

/// List one trash bin, oldest first
pub fn list(config: ResourceConfig, kind: TrashKind, json: bool) -> Result<()> {
    let res = super::mount(config, MountOptions::default())?;
    let entries = res.trash_list(kind)?;
    res.unmount()?;

    if json {
        let out: Vec<_> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "trash_id": e.trash_id,
                    "id": e.id,
                    "move_time": e.move_time,
                    "size": e.size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", style(format!("The {} trash is empty", kind)).dim());
        return Ok(());
    }

    println!(
        "{:<32} {:<24} {:>12}",
        style("TRASH ID").bold(),
        style("MOVED").bold(),
        style("SIZE").bold()
    );
    let mut total = 0;
    for e in &entries {
        total += e.size;
        println!(
            "{:<32} {:<24} {:>12}",
            e.trash_id,
            format_time(e.move_time),
            format_bytes(e.size)
        );
    }
    println!();
    println!("{} object(s), {}", entries.len(), format_bytes(total));

    Ok(())
}

/// Recover an allocation with a lifetime of `duration` seconds
pub fn undelete(
    config: ResourceConfig,
    kind: TrashKind,
    trash_id: &str,
    duration: u64,
    json: bool,
) -> Result<()> {
    let res = super::mount(config, MountOptions::default())?;
    let expiration = res.now() + duration;
    let recovered = res.undelete(kind, trash_id, expiration);
    res.unmount()?;
    let a = recovered?;

    if json {
        println!("{}", serde_json::to_string_pretty(&a)?);
        return Ok(());
    }

    println!(
        "{} Recovered allocation {} from the {} trash",
        style("✓").green(),
        style(a.id).cyan(),
        kind
    );
    println!("  Expires:  {}", format_time(a.expiration));
    println!("  Read cap: {}", a.caps.read);

    Ok(())
}
