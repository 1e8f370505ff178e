use std::collections::HashSet;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use arena_common::protocol::{
    self, ClientMessage, RequestBody, ServerMessage, framed_transport, serialize_message,
};

use crate::auth::Identity;
use crate::handler;
use crate::room::OutboundTx;
use crate::server::SharedState;

/// Everything a request handler needs to know about the connection it
/// arrived on. The identity was verified once at handshake and never
/// changes; the transport handle distinguishes this connection from a
/// reconnect of the same identity.
pub struct ConnectionCtx {
    pub connection_id: Uuid,
    pub identity: Identity,
    pub tx: OutboundTx,
}

pub async fn handle_connection(stream: TcpStream, state: SharedState) -> anyhow::Result<()> {
    let mut transport = framed_transport(stream);

    // Step 1: Handshake -- expect Hello, verify the identity before any
    // room operation is accepted.
    let hello: ClientMessage = match protocol::recv_message(&mut transport).await? {
        Some(msg) => msg,
        None => return Ok(()),
    };

    let identity = match hello {
        ClientMessage::Hello {
            token,
            identity_id,
            version,
        } => match state.verifier.verify(&token, identity_id).await {
            Ok(identity) => {
                tracing::info!(
                    "Identity {} authenticated (client version: {})",
                    identity.id,
                    version
                );
                protocol::send_message(
                    &mut transport,
                    &ServerMessage::Welcome {
                        identity_id: identity.id,
                        server_version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                )
                .await?;
                identity
            }
            Err(e) => {
                // Refused outright: no retry, no room state touched.
                tracing::warn!("Rejecting connection for {}: {}", identity_id, e);
                protocol::send_message(
                    &mut transport,
                    &ServerMessage::HandshakeError {
                        reason: e.to_string(),
                    },
                )
                .await?;
                return Ok(());
            }
        },
        _ => {
            protocol::send_message(
                &mut transport,
                &ServerMessage::HandshakeError {
                    reason: "Expected Hello message".into(),
                },
            )
            .await?;
            return Ok(());
        }
    };

    // Step 2: outbound channel. Unbounded, so broadcasts enqueued under
    // a room lock never block.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let ctx = ConnectionCtx {
        connection_id: Uuid::new_v4(),
        identity,
        tx,
    };

    // Step 3: Split transport for independent read/write
    let (mut sink, mut stream) = transport.split();

    // Writer task: drains rx and writes to sink
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serialize_message(&msg) {
                Ok(bytes) => {
                    if sink.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                }
            }
        }
    });

    // Rooms this connection has joined, for disconnect cleanup.
    let mut joined_rooms: HashSet<Uuid> = HashSet::new();

    // Step 4: Reader loop
    loop {
        match stream.next().await {
            Some(Ok(frame)) => match protocol::deserialize_message::<ClientMessage>(&frame) {
                Ok(ClientMessage::Request { seq, body }) => {
                    let room_id = body.room_id();
                    let joining = matches!(body, RequestBody::JoinRoom { .. });
                    let leaving = matches!(body, RequestBody::LeaveRoom { .. });
                    // Only acked joins count for disconnect cleanup; a
                    // rejected join never made this connection a member.
                    if handler::handle_request(&ctx, seq, body, &state).await {
                        if joining {
                            joined_rooms.insert(room_id);
                        } else if leaving {
                            joined_rooms.remove(&room_id);
                        }
                    }
                }
                Ok(ClientMessage::Ping) => {
                    let _ = ctx.tx.send(ServerMessage::Pong);
                }
                Ok(ClientMessage::Hello { .. }) => {
                    tracing::warn!("Duplicate Hello from {} ignored", identity.id);
                }
                Err(e) => {
                    tracing::warn!("Failed to parse message from {}: {}", identity.id, e);
                }
            },
            Some(Err(e)) => {
                tracing::warn!("Read error from {}: {}", identity.id, e);
                break;
            }
            None => {
                tracing::info!("Identity {} disconnected", identity.id);
                break;
            }
        }
    }

    // Cleanup: transport-level disconnect for every room still joined on
    // this connection. Stale events (the identity already reconnected)
    // are dropped inside the state machine by connection-id comparison.
    for room_id in joined_rooms {
        handler::handle_disconnect(room_id, &ctx, &state).await;
    }
    write_task.abort();
    Ok(())
}
