use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::auth::IdentityVerifier;
use crate::connection;
use crate::registry::RoomRegistry;
use crate::store::RoomStore;

pub struct ServerState {
    pub registry: RoomRegistry,
    pub store: Arc<dyn RoomStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub total_connections: AtomicU32,
    pub max_connections: u32,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(
        store: Arc<dyn RoomStore>,
        verifier: Arc<dyn IdentityVerifier>,
        max_connections: u32,
    ) -> SharedState {
        Arc::new(Self {
            registry: RoomRegistry::new(),
            store,
            verifier,
            total_connections: AtomicU32::new(0),
            max_connections,
        })
    }
}

pub async fn run(listener: TcpListener, state: SharedState) -> anyhow::Result<()> {
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;

        // Enforce max connections
        let conn_count = state.total_connections.load(Ordering::Relaxed);
        if conn_count >= state.max_connections {
            tracing::warn!(
                "Rejecting connection from {} (max {} reached)",
                peer_addr,
                state.max_connections
            );
            drop(stream);
            continue;
        }

        tracing::info!(
            "New connection from {} ({}/{})",
            peer_addr,
            conn_count + 1,
            state.max_connections
        );
        state.total_connections.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = connection::handle_connection(stream, state.clone()).await {
                tracing::warn!("Connection error from {}: {}", peer_addr, e);
            }
            state.total_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
