use anyhow::{Context, Result};
use clap::Parser;
use std::future::IntoFuture;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ami_bridge::{http, AmiConnection, Bridge, Config};

/// HTTP front end for a single Asterisk Manager Interface connection.
#[derive(Parser, Debug)]
#[command(name = "ami-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// File that log output is appended to
    #[arg(long, default_value = "logger.log")]
    log_file: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)
        .with_context(|| format!("failed to open log file {}", args.log_file.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    init_logging(&args)?;
    info!("Loaded configuration {:?}", config);

    let connection = AmiConnection::connect(
        &config.ami.host,
        config.ami.port,
        &config
            .ami
            .credentials(),
    )
    .await
    .context("failed to connect to AMI")?;
    let banner = connection
        .banner()
        .to_string();

    let (bridge, mut tasks) = Bridge::start(
        connection,
        config
            .bridge
            .options(),
    );

    let listener = TcpListener::bind((config.main.interface.as_str(), config.main.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind {}:{}",
                config.main.interface, config.main.port
            )
        })?;
    let address = listener.local_addr()?;

    println!("Connected to {}", banner.trim());
    println!("Listening on http://{}", address);
    println!("  register: http://{}/register/?token=<token>&name=<name>", address);
    println!(
        "  command:  http://{}/api/?token=<token>&Action=<action>&<Key>=<Value>...",
        address
    );

    let server = axum::serve(listener, http::router(bridge.clone())).into_future();

    tokio::select! {
        result = server => {
            result.context("HTTP server failed")?;
        }
        result = tasks.wait() => {
            result.context("bridge stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping dispatcher");
            if let Err(e) = bridge.shutdown().await {
                error!("Shutdown failed: {}", e);
            }
        }
    }

    tasks.abort();
    Ok(())
}
