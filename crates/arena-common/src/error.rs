use serde::{Deserialize, Serialize};

/// Failures a room operation can ack with. Always returned through the
/// request's ack, never pushed onto the broadcast channel.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
    #[error("battle already started")]
    RoomAlreadyStarted,
    #[error("only the host can start the battle")]
    NotHost,
    #[error("not a participant in this room")]
    NotInRoom,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    RoomAlreadyStarted,
    NotHost,
    NotInRoom,
    Storage,
    Internal,
}

/// Wire form of a failed ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&RoomError> for ErrorReply {
    fn from(e: &RoomError) -> Self {
        let code = match e {
            RoomError::RoomNotFound => ErrorCode::RoomNotFound,
            RoomError::RoomFull => ErrorCode::RoomFull,
            RoomError::RoomAlreadyStarted => ErrorCode::RoomAlreadyStarted,
            RoomError::NotHost => ErrorCode::NotHost,
            RoomError::NotInRoom => ErrorCode::NotInRoom,
            RoomError::Storage(_) => ErrorCode::Storage,
            RoomError::Internal(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}
