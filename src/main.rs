//! LLM Emulator - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use llm_emulator::{server, Emulator, EmulatorConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "llm-emulator",
    about = "Scriptable emulator for OpenAI-compatible LLM APIs",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "emulator.yaml")]
    config: PathBuf,

    /// Listen address, overrides `server.listen`
    #[arg(long, env = "EMULATOR_LISTEN", value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", include_str!("../config/emulator.yaml"));
        return Ok(());
    }

    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        EmulatorConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no preload script)");
        EmulatorConfig::default()
    };

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} API keys, preload script: {})",
            config.auth.api_keys.len(),
            if config.preload.is_some() { "yes" } else { "no" }
        );
        return Ok(());
    }

    let addr = match args.listen {
        Some(addr) => addr,
        None => config.server.listen_addr()?,
    };

    let emulator = Arc::new(Emulator::new(&config)?);
    server::serve(emulator, addr).await
}
