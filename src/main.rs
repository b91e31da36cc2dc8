//! `mcp-bridge(1)`: load a bridge config, connect the backend pool, and
//! re-expose the merged catalogue either over stdio or streamable HTTP.
//!
//! Grounded in the `wassette` binary's `Cli`/`Commands::Serve` shape (one
//! mutually-exclusive transport choice, stdio logging redirected to stderr
//! so it doesn't collide with the protocol stream on that transport) and
//! the teacher's `run()` wiring order: load config, build the manager,
//! spawn the health loop, start hosting.

use anyhow::{Context, Result};
use clap::Parser;
use mcp_bridge::config::{resolve_config_path, BridgeConfig};
use mcp_bridge::facade::AggregatedServer;
use mcp_bridge::{server, Gateway};
use rmcp::transport::stdio as stdio_transport;
use rmcp::ServiceExt;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_PORT: u16 = 8787;

/// An aggregating gateway that multiplexes many MCP servers behind one MCP
/// endpoint.
#[derive(Parser, Debug)]
#[command(name = "mcp-bridge", version, about, long_about = None)]
struct Cli {
    /// Path to the bridge config file. Falls back to `MCP_BRIDGE_CONFIG`,
    /// then `mcp-bridge.json` in the working directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve the aggregated catalogue over stdio instead of streamable HTTP.
    /// Useful when `mcp-bridge` itself is launched as another client's
    /// stdio backend.
    #[arg(long)]
    stdio: bool,

    /// Port to bind the streamable-HTTP hosting layer to, ignored with
    /// `--stdio`.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.stdio);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// stdio transport must not share a writer with the protocol stream, so
/// route logs to stderr on that path — matches the `wassette` binary's
/// rationale for the same split.
fn init_tracing(stdio: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if stdio {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config);
    let config = BridgeConfig::load_from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    tracing::info!(
        "loaded config from {}: {} backend(s)",
        config_path.display(),
        config.servers.len()
    );

    let gateway = Gateway::new(config);
    gateway.start().await;

    if cli.stdio {
        serve_stdio(gateway.clone()).await?;
    } else {
        server::serve(gateway.clone(), cli.port)
            .await
            .context("hosting layer exited with an error")?;
    }

    gateway.shutdown().await;
    tracing::info!("mcp-bridge shut down cleanly");
    Ok(())
}

/// Serve the aggregated facade over stdio until the client disconnects or a
/// shutdown signal fires, matching the `wassette` binary's
/// `serve(transport)` + `ctrl_c()` + `cancel()` sequence.
async fn serve_stdio(gateway: std::sync::Arc<Gateway>) -> Result<()> {
    tracing::info!("serving aggregated catalogue over stdio");
    let server = AggregatedServer::new(gateway);
    let running = server
        .serve(stdio_transport())
        .await
        .context("failed to start stdio transport")?;

    server::shutdown_signal().await;
    let _ = running.cancel().await;
    Ok(())
}
