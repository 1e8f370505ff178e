use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use arena_server::auth::{HttpVerifier, IdentityVerifier, InsecureVerifier};
use arena_server::server::{self, ServerState};
use arena_server::store::{MemoryStore, PgStore, RoomStore};

/// Arena Server - live battle-room coordinator
#[derive(Parser, Debug)]
#[command(name = "arena-server", version, about)]
struct Args {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:9470")]
    bind: String,

    /// Maximum simultaneous connections allowed
    #[arg(short, long, default_value_t = 1000)]
    max_connections: u32,

    /// Postgres connection string for the durable store. Without it the
    /// server runs on an in-memory store and nothing survives a restart.
    #[arg(long)]
    database_url: Option<String>,

    /// Identity verification endpoint. Without it every claimed
    /// identity is trusted, which is only acceptable locally.
    #[arg(long)]
    auth_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arena_server=debug,arena_common=debug".into()),
        )
        .init();

    let args = Args::parse();

    let addr: SocketAddr = args.bind.parse()?;

    let store: Arc<dyn RoomStore> = match &args.database_url {
        Some(url) => {
            tracing::info!("Connecting to durable store");
            Arc::new(PgStore::connect(url).await?)
        }
        None => {
            tracing::warn!("No database URL given; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let verifier: Arc<dyn IdentityVerifier> = match args.auth_url {
        Some(url) => Arc::new(HttpVerifier::new(url)),
        None => {
            tracing::warn!("No auth URL given; trusting claimed identities");
            Arc::new(InsecureVerifier)
        }
    };

    tracing::info!(
        "Starting arena server on {} (max {} connections)",
        addr,
        args.max_connections
    );
    let listener = TcpListener::bind(addr).await?;
    let state = ServerState::new(store, verifier, args.max_connections);
    server::run(listener, state).await
}
