//! Zentinel Service Mock - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_service_mock::{MockConfig, MockEngine, MockServer};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-service-mock",
    about = "Service virtualization - mock HTTP services and message-broker actors",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "service-mock.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Bind every HTTP service on this address instead of its hostname
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Active tag (repeatable)
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Seed for performance profiles
    #[arg(long)]
    seed: Option<u64>,

    /// Print a sample configuration and exit
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
        println!("{}", include_str!("../demos/sample-config.yaml"));
        return Ok(());
    }

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    }
    info!(path = ?args.config, "Loading configuration");
    let config = MockConfig::from_file(&args.config)?;

    if args.validate {
        println!(
            "Configuration is valid ({} HTTP services, {} async services)",
            config.http_services().count(),
            config.async_services().count()
        );
        return Ok(());
    }

    let mut builder = MockEngine::builder(config).active_tags(args.tags);
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    let engine = Arc::new(builder.build()?);
    engine.start()?;

    let server = MockServer::bind(&engine, args.bind.as_deref()).await?;
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    engine.stop().await;
    Ok(())
}
