//! Administrative tool for running modules

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use ipc_dylink::utils::{init_logging_from_config, retry_async_with_backoff, RetryConfig};
use ipc_dylink::{DylinkConfig, ModuleRegistry};

#[derive(Parser, Debug)]
#[command(about = "Inspect and control ipc-dylink modules")]
struct Cli {
    /// Config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the rendezvous directory
    #[arg(long, global = true)]
    channel_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Force a module to drain, whoever holds it open
    Kill { identity: String },
    /// Report whether a module channel is published
    Probe { identity: String },
    /// Load a module, query one symbol, unload
    Query {
        identity: String,
        symbol: String,
        /// Load attempts before giving up
        #[arg(long, default_value_t = 1)]
        attempts: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DylinkConfig::from_file(path)?,
        None => DylinkConfig::default(),
    };
    if let Some(dir) = &cli.channel_dir {
        config.loader.channel_dir = dir.to_string_lossy().to_string();
    }
    init_logging_from_config(config.logging.as_ref());

    let registry = ModuleRegistry::from_config(&config);

    match cli.command {
        Command::Kill { identity } => {
            if !registry.kill(&identity).await? {
                println!("{}: not running", identity);
            } else if registry.wait_for_withdrawal(&identity).await {
                println!("{}: terminated", identity);
            } else {
                println!("{}: kill sent, channel still published", identity);
            }
        }
        Command::Probe { identity } => {
            let published = registry.namespace().is_published(&identity).await;
            println!(
                "{}: {}",
                identity,
                if published { "published" } else { "absent" }
            );
        }
        Command::Query {
            identity,
            symbol,
            attempts,
        } => {
            let retry = RetryConfig::new(attempts.max(1), Duration::from_millis(200));
            let handle = retry_async_with_backoff(&retry, || registry.load(&identity))
                .await
                .with_context(|| format!("failed to load {}", identity))?;
            let result = registry.get_capability(&handle, &symbol).await;
            registry.unload(&handle).await?;
            match result? {
                Some(capability) => println!("{}:{} = {}", identity, symbol, capability),
                None => println!("{}:{} not exported", identity, symbol),
            }
        }
    }

    Ok(())
}
