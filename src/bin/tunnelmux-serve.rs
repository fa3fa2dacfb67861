use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tunnelmux::transport::WebSocketTransport;
use tunnelmux::{Config, ServerDriver};

/// Accepts WebSocket tunnel connections from `tunnelmux-listen` peers and
/// auto-connects their socket ids out to a fixed target address.
#[derive(Parser)]
#[command(name = "tunnelmux-serve")]
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

    let target = config.tunnel_to_addr()?;
    info!(bind = %config.listen_on, tunnel_to = %target, "starting tunnelmux-serve");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    let listener = TcpListener::bind(config.listen_on).await?;
    let driver = Arc::new(ServerDriver::new(target, config.timeout_config()));

    // Each accepted WebSocket becomes one independent tunnel session; a
    // JoinSet bounds the supervision overhead of tracking them without
    // bounding how many may run concurrently.
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let driver = driver.clone();
                let session_cancel = cancel.child_token();
                sessions.spawn(async move {
                    let stream = match accept_async(stream).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(%peer, %err, "websocket handshake failed");
                            return;
                        }
                    };
                    let transport = Arc::new(WebSocketTransport::new(stream));
                    info!(%peer, "tunnel session established");
                    if let Err(err) = driver.run_session(transport, session_cancel).await {
                        if !matches!(err, tunnelmux::SessionError::Cancelled) {
                            error!(%peer, %err, "tunnel session ended");
                        }
                    }
                });
            }
            Some(result) = sessions.join_next() => {
                if let Err(join_err) = result {
                    warn!(%join_err, "tunnel session task panicked");
                }
            }
        }
    }

    while sessions.join_next().await.is_some() {}
    Ok(())
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
