//! CryptSync Server
//!
//! A self-hostable sync server for end-to-end encrypted datasets. The
//! server stores opaque ciphertexts, device public keys, and possession
//! proofs; it never holds encryption keys or plaintext data.

use clap::Parser;
use cryptsync_server::{broker, config, database, session, ws};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cryptsync-server", about = "CryptSync dataset sync server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "cryptsync.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::ServerConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::ServerConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.database.name = database;
    }

    tracing::info!("Starting CryptSync server on {}", cfg.listen_addr);

    let db = database::DatabaseController::open(&cfg.database.name)
        .await
        .map_err(|e| anyhow::anyhow!("failed to open database: {e}"))?;
    let broker = broker::Broker::new();

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let db = db.clone();
        let broker = broker.clone();
        let upload_limit = cfg.upload_limit;

        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => ws_stream,
                Err(e) => {
                    tracing::debug!(%peer_addr, "websocket handshake failed: {e}");
                    return;
                }
            };
            tracing::debug!(%peer_addr, "new client connection");
            let transport = ws::WsServerTransport::new(ws_stream);
            session::Session::new(transport, db, broker, upload_limit)
                .run()
                .await;
            tracing::debug!(%peer_addr, "client connection closed");
        });
    }
}
