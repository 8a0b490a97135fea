//! Allocation Commands
//!
//! Inspect single allocations and the expiration order.

use super::{format_bytes, format_time};
use anyhow::Result;
use console::style;
use ibp_core::{AllocationId, AllocationRecord, CapKind, Capability, ResourceConfig};
use ibp_storage::{HistoryEvent, MountOptions};

/// How to find an allocation
pub enum Lookup {
    Id(AllocationId),
    Cap(CapKind, String),
}

/// Show one allocation
pub fn get(config: ResourceConfig, lookup: Lookup, history: bool, json: bool) -> Result<()> {
    let res = super::mount(config, MountOptions::default())?;
    let found = match &lookup {
        Lookup::Id(id) => res.get_by_id(*id),
        Lookup::Cap(kind, cap) => res.get_by_cap(*kind, &Capability::new(cap.as_str())),
    };
    let table = match (&found, history) {
        (Ok(a), true) => Some(res.history(a.id)?),
        _ => None,
    };
    res.unmount()?;
    let a = found?;

    if json {
        let out = serde_json::json!({
            "allocation": a,
            "read_refcount": a.read_refcount(),
            "write_refcount": a.write_refcount(),
            "history": table,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_record(&a);

    if let Some(table) = table {
        for (name, events) in [
            ("Read", &table.read),
            ("Write", &table.write),
            ("Manage", &table.manage),
        ] {
            println!();
            println!("  {}", style(format!("{} history:", name)).bold());
            if events.is_empty() {
                println!("    {}", style("(none)").dim());
            }
            for event in events {
                print_event(event);
            }
        }
    }

    Ok(())
}

/// List allocations in expiration order
pub fn expire_list(config: ResourceConfig, start: Option<u64>, max: usize, json: bool) -> Result<()> {
    let start = start.unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64);
    let res = super::mount(config, MountOptions::default())?;
    let keys = res.expire_list(start, max)?;
    res.unmount()?;

    if json {
        let out: Vec<_> = keys
            .iter()
            .map(|k| serde_json::json!({ "expiration": k.expiration, "id": k.id }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if keys.is_empty() {
        println!("{}", style("No allocations expire after the given time").dim());
        return Ok(());
    }

    println!("{:<24} {}", style("EXPIRES").bold(), style("ID").bold());
    for k in &keys {
        println!("{:<24} {}", format_time(k.expiration), k.id);
    }
    println!();
    println!("{} allocation(s)", keys.len());

    Ok(())
}

fn print_record(a: &AllocationRecord) {
    println!("{}", style(format!("Allocation {}", a.id)).bold().underlined());
    println!();
    println!("  Reliability: {}", style(a.reliability).cyan());
    println!("  Type:        {:?}", a.alloc_type);
    println!(
        "  Size:        {} of {}",
        style(format_bytes(a.size)).cyan(),
        format_bytes(a.max_size)
    );
    println!("  Created:     {}", format_time(a.creation_ts));
    println!("  Expires:     {}", format_time(a.expiration));
    println!(
        "  References:  {} read, {} write",
        a.read_refcount(),
        a.write_refcount()
    );
    if a.is_alias {
        println!("  Alias:       {}", style("yes").yellow());
    }
    if let Some(parent) = a.split_parent_id {
        println!("  Split from:  {}", parent);
    }
    if let Some(chk) = &a.checksum {
        println!("  Checksum:    {} / {} byte blocks", chk.kind, chk.block_size);
    }
    println!();
    for kind in CapKind::ALL {
        println!("  {:<7} {}", format!("{}:", kind), style(a.caps.get(kind)).dim());
    }
}

fn print_event(event: &HistoryEvent) {
    let client = event.client.as_deref().unwrap_or("-");
    println!(
        "    {}  {:<15} {:?}",
        format_time(event.time),
        client,
        event.kind
    );
}
