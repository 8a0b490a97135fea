//! Usage Command
//!
//! Shows quota, trash and device accounting of a resource.

use super::format_bytes;
use anyhow::Result;
use console::style;
use ibp_core::{Reliability, ResourceConfig};
use ibp_storage::{MountOptions, TrashKind};

/// Run usage command
pub fn run(config: ResourceConfig, json: bool) -> Result<()> {
    let res = super::mount(config, MountOptions::default())?;
    let usage = res.usage()?;
    res.unmount()?;

    let c = usage.counters;
    let l = usage.limits;

    if json {
        let out = serde_json::json!({
            "rid": res.rid(),
            "n_allocs": c.n_allocs,
            "n_alias": c.n_alias,
            "used": {
                "soft": c.used(Reliability::Soft),
                "hard": c.used(Reliability::Hard),
                "total": c.used_total(),
            },
            "limits": {
                "total": l.max_total,
                "soft": l.max_soft,
                "hard": l.max_hard,
                "minfree": l.minfree,
            },
            "trash": {
                "delete": { "count": c.n_trash[TrashKind::Delete.index()], "bytes": c.trash_size[TrashKind::Delete.index()] },
                "expire": { "count": c.n_trash[TrashKind::Expire.index()], "bytes": c.trash_size[TrashKind::Expire.index()] },
            },
            "free_bytes": usage.free_bytes,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{}",
        style(format!("Resource {}", res.rid())).bold().underlined()
    );
    println!();
    println!("  Allocations: {} ({} aliases)", style(c.n_allocs).cyan(), c.n_alias);
    for class in Reliability::ALL {
        println!(
            "  {:<11} {} / {}",
            format!("{}:", class),
            style(format_bytes(c.used(class))).cyan(),
            format_bytes(l.class_max(class))
        );
    }
    println!(
        "  {:<11} {} / {}",
        "total:",
        style(format_bytes(c.used_total())).cyan(),
        format_bytes(l.max_total)
    );
    println!();

    println!("  {}", style("Trash:").bold());
    for kind in [TrashKind::Delete, TrashKind::Expire] {
        println!(
            "    {:<8} {} objects, {}",
            format!("{}:", kind),
            c.n_trash[kind.index()],
            format_bytes(c.trash_size[kind.index()])
        );
    }
    println!();

    let free_style = if usage.free_bytes < l.minfree {
        style(format_bytes(usage.free_bytes)).red()
    } else {
        style(format_bytes(usage.free_bytes)).green()
    };
    println!("  Device free: {} (min {})", free_style, format_bytes(l.minfree));

    Ok(())
}
