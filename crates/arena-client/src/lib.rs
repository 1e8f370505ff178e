//! Headless client for the arena server: one TCP connection,
//! authenticated once, with request/ack correlation and a stream of
//! server-pushed room events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use arena_common::error::ErrorReply;
use arena_common::protocol::{
    self, AckBody, ClientMessage, RequestBody, RoomEvent, ServerMessage, framed_transport,
    serialize_message,
};
use arena_common::room::RoomSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("request rejected: {}", .0.message)]
    Rejected(ErrorReply),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unexpected server message")]
    Protocol,
    #[error("transport error: {0}")]
    Transport(String),
}

type AckResult = Result<AckBody, ErrorReply>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckResult>>>>;

pub struct BattleClient {
    identity_id: Uuid,
    tx: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingAcks,
    next_seq: AtomicU64,
}

impl BattleClient {
    /// Connects and authenticates. Returns the client plus the stream of
    /// broadcast events for every room joined on this connection.
    pub async fn connect(
        addr: &str,
        token: &str,
        identity_id: Uuid,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoomEvent>), ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let mut transport = framed_transport(stream);

        protocol::send_message(
            &mut transport,
            &ClientMessage::Hello {
                token: token.to_string(),
                identity_id,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

        match protocol::recv_message::<ServerMessage>(&mut transport)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
        {
            Some(ServerMessage::Welcome { identity_id: id, .. }) => {
                tracing::debug!("Authenticated as {}", id);
            }
            Some(ServerMessage::HandshakeError { reason }) => {
                return Err(ClientError::Refused(reason));
            }
            _ => return Err(ClientError::Protocol),
        }

        let (mut sink, mut stream) = transport.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RoomEvent>();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        // Writer task: out_rx -> TCP sink. Closing the sink when the
        // client is dropped half-closes the socket so the server runs
        // its disconnect path.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match serialize_message(&msg) {
                    Ok(bytes) => {
                        if sink.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize client message: {}", e);
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader task: routes acks to their waiters, events to the
        // caller. Dropping the pending map on exit wakes every waiter
        // with ConnectionClosed.
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                match protocol::deserialize_message::<ServerMessage>(&frame) {
                    Ok(ServerMessage::Ack { seq, result }) => {
                        if let Some(waiter) = reader_pending.lock().await.remove(&seq) {
                            let _ = waiter.send(result);
                        } else {
                            tracing::warn!("Ack for unknown request {}", seq);
                        }
                    }
                    Ok(ServerMessage::Event(event)) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(ServerMessage::Pong) => {}
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Failed to parse server message: {}", e);
                    }
                }
            }
            reader_pending.lock().await.clear();
        });

        Ok((
            Self {
                identity_id,
                tx: out_tx,
                pending,
                next_seq: AtomicU64::new(1),
            },
            event_rx,
        ))
    }

    pub fn identity_id(&self) -> Uuid {
        self.identity_id
    }

    async fn request(&self, body: RequestBody) -> Result<AckBody, ClientError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, ack_tx);

        if self
            .tx
            .send(ClientMessage::Request { seq, body })
            .is_err()
        {
            self.pending.lock().await.remove(&seq);
            return Err(ClientError::ConnectionClosed);
        }

        match ack_rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(reply)) => Err(ClientError::Rejected(reply)),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    pub async fn join_room(
        &self,
        room_id: Uuid,
        display_name: &str,
    ) -> Result<RoomSnapshot, ClientError> {
        match self
            .request(RequestBody::JoinRoom {
                room_id,
                display_name: display_name.to_string(),
            })
            .await?
        {
            AckBody::RoomJoined { room } => Ok(room),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn leave_room(&self, room_id: Uuid) -> Result<(), ClientError> {
        match self.request(RequestBody::LeaveRoom { room_id }).await? {
            AckBody::RoomLeft => Ok(()),
            _ => Err(ClientError::Protocol),
        }
    }

    pub async fn start_battle(&self, room_id: Uuid) -> Result<(), ClientError> {
        match self.request(RequestBody::StartBattle { room_id }).await? {
            AckBody::BattleStarted => Ok(()),
            _ => Err(ClientError::Protocol),
        }
    }

    /// Reports a judge result. The ack carries the caller's rank so it
    /// can render immediately, without waiting for the broadcast.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_code(
        &self,
        room_id: Uuid,
        code: &str,
        language: &str,
        tests_passed: u32,
        total_tests: u32,
        time_taken: u64,
    ) -> Result<u32, ClientError> {
        match self
            .request(RequestBody::SubmitCode {
                room_id,
                code: code.to_string(),
                language: language.to_string(),
                tests_passed,
                total_tests,
                time_taken,
            })
            .await?
        {
            AckBody::SubmissionRanked { rank } => Ok(rank),
            _ => Err(ClientError::Protocol),
        }
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.tx
            .send(ClientMessage::Ping)
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
