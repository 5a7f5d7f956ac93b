//! chainhead CLI: inspect tracker defaults and replay a reorg scenario.
//!
//! # Commands
//! ```text
//! chainhead info
//! chainhead demo [--json] [--config <file>]
//! chainhead version
//! ```

mod demo;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use chainhead_core::TrackerConfig;

use crate::demo::DemoConfig;
use crate::logging::init_tracing;

#[derive(Parser)]
#[command(
    name = "chainhead",
    about = "Reorg-aware chain head tracker with consistent log delivery",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show tracker defaults
    Info,

    /// Replay a scripted fork against an in-memory chain
    Demo(DemoArgs),

    /// Print version
    Version,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Emit JSON structured logs
    #[arg(long)]
    json: bool,

    /// JSON file with `tracker` and `log` sections
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Demo(args) => cmd_demo(args).await,
        Commands::Version => {
            println!("chainhead {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn cmd_info() {
    let d = TrackerConfig::default();
    println!("ChainHead v{}", env!("CARGO_PKG_VERSION"));
    println!("  Block window: {} blocks", d.max_block_cached);
    println!(
        "  Block fetch retries: {} (every {} ms)",
        d.max_retry_get_block, d.retry_delay_get_block_ms
    );
    println!(
        "  Log fetch retries: {} (every {} ms)",
        d.max_retry_get_logs, d.retry_delay_get_logs_ms
    );
    println!("  Sources: in-memory, EVM JSON-RPC (chainhead-evm)");
}

async fn cmd_demo(args: DemoArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => DemoConfig::load(path)?,
        None => DemoConfig::default(),
    };
    config.log.json |= args.json;
    config.tracker.validate()?;

    init_tracing(&config.log)?;
    demo::run(config).await
}
