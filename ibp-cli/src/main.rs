//! IBP resource administration tool
//!
//! Offline maintenance of a depot resource directory.
//!
//! # Commands
//! - `mkfs` - Format a resource and write its config file
//! - `rebuild` - Rebuild the allocation store in a given mode
//! - `usage` - Show quota and trash accounting
//! - `get-alloc` - Show one allocation by id or capability
//! - `expire-list` - List allocations in expiration order
//! - `trash-list` - List one trash bin
//! - `undelete` - Recover an allocation from trash
//!
//! # Configuration
//! Every command except `mkfs` reads the resource TOML given with `--config`
//! or `IBP_RESOURCE_CONFIG`. `mkfs` writes `<device>/resource.toml` unless
//! told otherwise.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;

use commands::{alloc, mkfs, rebuild, trash, usage};

#[derive(Parser)]
#[command(name = "ibp-resource")]
#[command(about = "IBP depot resource administration")]
#[command(version)]
struct Cli {
    /// Resource config file
    #[arg(short, long, global = true, env = "IBP_RESOURCE_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a resource directory
    Mkfs {
        /// Resource id
        #[arg(long)]
        rid: String,

        /// Directory holding the allocations
        device: PathBuf,

        /// Aggregate quota in MB; soft and hard quotas default to it
        #[arg(long)]
        size_mb: u64,

        /// Free space to keep in reserve, in MB
        #[arg(long)]
        minfree_mb: Option<u64>,

        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Rebuild the allocation store
    Rebuild {
        /// 1 = repair indices, 2 = full rebuild, 3 = full rebuild resetting expirations
        #[arg(short, long, default_value = "2")]
        mode: String,

        /// Clamp expirations beyond the maximum duration
        #[arg(short, long)]
        truncate: bool,
    },

    /// Show quota and trash accounting
    Usage,

    /// Show one allocation
    GetAlloc {
        /// Allocation id, or a capability with --cap
        key: String,

        /// Look up by capability of this kind instead of by id
        #[arg(long, value_enum)]
        cap: Option<CapArg>,

        /// Include the access history
        #[arg(long)]
        history: bool,
    },

    /// List allocations in expiration order
    ExpireList {
        /// Start time, seconds since the epoch (default: now)
        #[arg(long)]
        start: Option<u64>,

        /// Maximum number of entries
        #[arg(short = 'n', long, default_value = "100")]
        max: usize,
    },

    /// List a trash bin
    TrashList {
        #[arg(value_enum, default_value = "delete")]
        bin: BinArg,
    },

    /// Recover an allocation from trash
    Undelete {
        #[arg(value_enum)]
        bin: BinArg,

        /// Entry name as printed by trash-list
        trash_id: String,

        /// New lifetime in seconds
        #[arg(short, long)]
        duration: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CapArg {
    Read,
    Write,
    Manage,
}

#[derive(Clone, Copy, ValueEnum)]
enum BinArg {
    Delete,
    Expire,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    match cli.command {
        Commands::Mkfs {
            rid,
            device,
            size_mb,
            minfree_mb,
            force,
        } => {
            let config = mkfs::MkfsConfig {
                rid,
                device,
                size_mb,
                minfree_mb,
                config_path: cli.config,
                force,
            };
            mkfs::run(config)?;
        }

        Commands::Rebuild { mode, truncate } => {
            let resource = commands::load_config(cli.config)?;
            rebuild::run(resource, &mode, truncate, json)?;
        }

        Commands::Usage => {
            let resource = commands::load_config(cli.config)?;
            usage::run(resource, json)?;
        }

        Commands::GetAlloc { key, cap, history } => {
            let resource = commands::load_config(cli.config)?;
            let lookup = match cap {
                None => alloc::Lookup::Id(ibp_core::AllocationId::new(key.parse()?)),
                Some(CapArg::Read) => alloc::Lookup::Cap(ibp_core::CapKind::Read, key),
                Some(CapArg::Write) => alloc::Lookup::Cap(ibp_core::CapKind::Write, key),
                Some(CapArg::Manage) => alloc::Lookup::Cap(ibp_core::CapKind::Manage, key),
            };
            alloc::get(resource, lookup, history, json)?;
        }

        Commands::ExpireList { start, max } => {
            let resource = commands::load_config(cli.config)?;
            alloc::expire_list(resource, start, max, json)?;
        }

        Commands::TrashList { bin } => {
            let resource = commands::load_config(cli.config)?;
            trash::list(resource, bin.into(), json)?;
        }

        Commands::Undelete {
            bin,
            trash_id,
            duration,
        } => {
            let resource = commands::load_config(cli.config)?;
            trash::undelete(resource, bin.into(), &trash_id, duration, json)?;
        }
    }

    Ok(())
}

impl From<BinArg> for ibp_storage::TrashKind {
    fn from(bin: BinArg) -> Self {
        match bin {
            BinArg::Delete => ibp_storage::TrashKind::Delete,
            BinArg::Expire => ibp_storage::TrashKind::Expire,
        }
    }
}
