//! iam-basic-provider
//!
//! Example provider process: serves an in-memory directory of `iam.role` and
//! `iam.user` resources to the engine over length-prefixed JSON-RPC on
//! stdin/stdout. Logs go to stderr.

use anyhow::Result;
use clap::Parser;
use iam_core::config::load_environment;
use iam_core::{init_logging, EngineConfig};
use iam_jsonrpc::prelude::*;
use tracing::info;

mod directory;

use directory::Directory;

#[derive(Parser, Debug)]
#[command(name = "iam-basic-provider")]
#[command(about = "Example iamctl provider serving roles and users over stdin/stdout")]
struct Args {
    /// Print the resource type descriptors as JSON and exit
    #[arg(long)]
    describe: bool,

    /// Largest frame accepted from the engine (defaults to IAMCTL_MAX_FRAME_BYTES)
    #[arg(long)]
    max_frame_bytes: Option<usize>,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_environment();
    let args = Args::parse();
    let mut config = EngineConfig::from_env();
    if args.log_json {
        config.log.json = true;
    }
    init_logging(&config.log);

    let directory = Directory::new();

    if args.describe {
        let types = directory.resource_types();
        println!("{}", serde_json::to_string_pretty(&types)?);
        return Ok(());
    }

    let max_frame_bytes = args.max_frame_bytes.unwrap_or(config.max_frame_bytes);
    info!("Starting iam-basic-provider (max frame {} bytes)", max_frame_bytes);

    let server = ProviderServer::new(directory);
    server.serve(FramedChannel::stdio(max_frame_bytes)).await?;

    info!("iam-basic-provider stopped");
    Ok(())
}
