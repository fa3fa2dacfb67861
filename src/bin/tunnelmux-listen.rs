use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tunnelmux::transport::WebSocketTransport;
use tunnelmux::{Config, ListenerDriver};

/// Accepts local TCP connections and multiplexes them over one outbound
/// WebSocket tunnel to a `tunnelmux-serve` peer.
#[derive(Parser)]
#[command(name = "tunnelmux-listen")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, default_value = "tunnelmux.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_logging(config.log_path.as_deref());

    info!(listen_on = %config.listen_on, peer = %config.tunnel_to_ws(), "starting tunnelmux-listen");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    let (stream, _response) = connect_async(config.tunnel_to_ws()).await?;
    let transport = Arc::new(WebSocketTransport::new(stream));
    let driver = ListenerDriver::new(config.listen_on, config.timeout_config());

    match driver.run(transport, cancel).await {
        Ok(()) => Ok(()),
        Err(tunnelmux::SessionError::Cancelled) => Ok(()),
        Err(err) => {
            error!(%err, "tunnelmux-listen session ended");
            Err(err.into())
        }
    }
}

fn init_logging(log_path: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_path {
        Some(path) => {
            let file_appender = tracing_appender::rolling::daily(".", path);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            Box::leak(Box::new(guard));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
