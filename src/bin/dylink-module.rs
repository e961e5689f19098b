//! Generic module host
//!
//! Serves an export table under an identity until every client has closed
//! it (or it is killed), then withdraws its channel and exits.
//!
//! Usage:
//!   dylink-module --identity <id> --channel-dir <dir> [--exports <toml>] [--config <toml>]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use ipc_dylink::utils::init_module_logging;
use ipc_dylink::{Capability, DylinkConfig, ExportTable, ModuleService, SocketNamespace};

#[derive(Parser, Debug)]
#[command(about = "Serve a module export table over a rendezvous channel")]
struct Args {
    /// Identity to publish under
    #[arg(long)]
    identity: String,

    /// Directory holding rendezvous sockets
    #[arg(long)]
    channel_dir: PathBuf,

    /// TOML file with an [exports] table; defaults to the demo table
    #[arg(long)]
    exports: Option<PathBuf>,

    /// Config file for the [service] section
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Mandatory capabilities plus one ordinary export
fn demo_exports() -> anyhow::Result<ExportTable> {
    let pairs = [
        ("dylink_init", 0x1000u64),
        ("dylink_fini", 0x1010),
        ("dylink_version", 0x1020),
        ("Foo", 0xf00),
    ];
    let exports = pairs
        .into_iter()
        .map(|(name, raw)| {
            Capability::new(raw)
                .map(|cap| (name, cap))
                .context("demo capability is zero")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(ExportTable::new(exports)?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DylinkConfig::from_file(path)?,
        None => DylinkConfig::default(),
    };
    init_module_logging("dylink_module", config.log_filter());

    let exports = match &args.exports {
        Some(path) => ExportTable::from_file(path)?,
        None => demo_exports()?,
    };

    let mut names: Vec<&str> = exports.names().collect();
    names.sort_unstable();
    info!("Serving {} exports: {}", names.len(), names.join(", "));

    let namespace = SocketNamespace::new(&args.channel_dir);
    let service = ModuleService::new(&args.identity, namespace, exports, config.service);
    let identity = service.identity().to_string();
    let state = service
        .run()
        .await
        .with_context(|| format!("module {} failed", identity))?;

    info!("Module {} exiting in state {:?}", identity, state);
    Ok(())
}
