// src/main.rs
//! Worldlog command line
//!
//! Inspects an audit store without a running world: lookups and rollback or
//! restore previews. Parameters use the same `name:value` tokens as in-world
//! commands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use worldlog_engine::observability::{init_metrics, init_tracing};
use worldlog_engine::rollback::{DirectExecutor, MemoryWorld};
use worldlog_engine::{EngineConfig, EngineContext, Flag, Requester, VERSION};

#[derive(Parser)]
#[command(name = "worldlog", version, about = "Inspect a worldlog audit store")]
struct Cli {
    /// Configuration file (defaults to ./worldlog.{toml,yaml,json} if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search recorded events, e.g. `lookup p:alice t:2h -nogroup`
    Lookup {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Show what a rollback (or restore) would change
    Preview {
        #[arg(long)]
        restore: bool,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Validate and print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::load()?,
    };

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;
    info!("Worldlog v{}", VERSION);

    if let Command::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    // Nothing here mutates a world; previews never reach the executor
    let executor = Arc::new(DirectExecutor::new(MemoryWorld::new()));
    let ctx = EngineContext::start(config, executor).await?;

    let outcome = run(&ctx, cli.command).await;
    ctx.shutdown().await?;
    outcome
}

async fn run(ctx: &EngineContext, command: Command) -> Result<()> {
    match command {
        Command::Lookup { params } => {
            let session = ctx.parse(&params, Requester::console())?;
            let results = ctx.lookup(session).await?;
            info!("Lookup matched {} records", results.record_count());
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Preview { restore, params } => {
            let mut session = ctx.parse(&params, Requester::console())?;
            session.add_flag(Flag::DryRun);

            let cancel = tokio_util::sync::CancellationToken::new();
            let summary = if restore {
                ctx.restore(session, &cancel).await?
            } else {
                ctx.rollback(session, &cancel).await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Config => {}
    }
    Ok(())
}
