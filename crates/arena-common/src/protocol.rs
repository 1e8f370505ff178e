use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::error::ErrorReply;
use crate::leaderboard::LeaderboardEntry;
use crate::room::{RoomSnapshot, RoomUpdateReason};

// -- Framing --

pub type Transport = Framed<TcpStream, LengthDelimitedCodec>;

/// Frames are length-delimited JSON. The cap leaves room for a full
/// source-code submission plus the surrounding envelope.
pub fn framed_transport(stream: TcpStream) -> Transport {
    LengthDelimitedCodec::builder()
        .max_frame_length(1024 * 1024)
        .new_framed(stream)
}

// -- Client -> Server Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake. Must be the first message on a connection; the server
    /// verifies the token against the claimed identity before anything
    /// else is accepted.
    Hello {
        token: String,
        identity_id: Uuid,
        version: String,
    },

    /// A room operation. Every request is acked exactly once, matched
    /// by `seq`.
    Request { seq: u64, body: RequestBody },

    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    JoinRoom {
        room_id: Uuid,
        display_name: String,
    },
    LeaveRoom {
        room_id: Uuid,
    },
    StartBattle {
        room_id: Uuid,
    },
    SubmitCode {
        room_id: Uuid,
        code: String,
        language: String,
        tests_passed: u32,
        total_tests: u32,
        time_taken: u64,
    },
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::StartBattle { .. } => "start_battle",
            Self::SubmitCode { .. } => "submit_code",
        }
    }

    pub fn room_id(&self) -> Uuid {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::LeaveRoom { room_id }
            | Self::StartBattle { room_id }
            | Self::SubmitCode { room_id, .. } => *room_id,
        }
    }
}

// -- Server -> Client Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    // Handshake
    Welcome {
        identity_id: Uuid,
        server_version: String,
    },
    HandshakeError {
        reason: String,
    },

    /// The single ack for the request with the same `seq`.
    Ack {
        seq: u64,
        result: Result<AckBody, ErrorReply>,
    },

    /// Fan-out state change. No ack expected.
    Event(RoomEvent),

    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AckBody {
    RoomJoined { room: RoomSnapshot },
    RoomLeft,
    BattleStarted,
    SubmissionRanked { rank: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomEvent {
    PlayerJoined {
        identity_id: Uuid,
        display_name: String,
    },
    PlayerLeft {
        identity_id: Uuid,
    },
    BattleStarted {
        room_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    SubmissionBroadcast {
        identity_id: Uuid,
        tests_passed: u32,
        total_tests: u32,
        time_taken: u64,
        rank: u32,
        all_passed: bool,
    },
    RoomUpdate {
        reason: RoomUpdateReason,
        room: RoomSnapshot,
    },
    LeaderboardUpdate {
        entries: Vec<LeaderboardEntry>,
    },
}

// -- Serialization helpers --

pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    Ok(Bytes::from(json))
}

pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

// -- Transport helpers --

pub async fn send_message<T: Serialize>(
    transport: &mut Transport,
    msg: &T,
) -> anyhow::Result<()> {
    let bytes = serialize_message(msg).map_err(|e| anyhow::anyhow!("serialize error: {}", e))?;
    transport
        .send(bytes)
        .await
        .map_err(|e| anyhow::anyhow!("send error: {}", e))
}

pub async fn recv_message<T: for<'de> Deserialize<'de>>(
    transport: &mut Transport,
) -> anyhow::Result<Option<T>> {
    match transport.next().await {
        Some(Ok(frame)) => {
            let msg = deserialize_message(&frame)
                .map_err(|e| anyhow::anyhow!("deserialize error: {}", e))?;
            Ok(Some(msg))
        }
        Some(Err(e)) => Err(anyhow::anyhow!("recv error: {}", e)),
        None => Ok(None),
    }
}
