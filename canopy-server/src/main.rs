//! Canopy sync server.
//!
//! Serves every document under `--doc-path` over HTTP and WebSocket. Auth
//! is the development setup: any token is accepted as the same user, who
//! may write every document and create new ones.

use std::path::PathBuf;
use std::sync::Arc;

use canopy_collab::{http, AllowAll, AnyTokenAuthenticator, DocManager, FileStore, ServerConfig};
use clap::Parser;
use log::info;

/// Real-time collaborative tree document server
#[derive(Parser, Debug)]
#[command(name = "canopy-server")]
#[command(version)]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 4000, env = "PORT")]
    port: u16,

    /// Directory holding document snapshots
    #[arg(long, env = "DOC_PATH")]
    doc_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    info!("starting: host={} port={} doc_path={}", cli.host, cli.port, cli.doc_path.display());

    let store = Arc::new(FileStore::open(&cli.doc_path).await?);
    let manager = DocManager::new(
        store,
        Arc::new(AnyTokenAuthenticator::default()),
        Arc::new(AllowAll),
        ServerConfig::default(),
    );

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    http::serve(listener, manager, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;

    Ok(())
}
