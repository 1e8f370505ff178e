use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a battle room. Transitions only move forward:
/// `Waiting -> Active -> Finished`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    /// Reserved for a future countdown phase. No transition currently
    /// produces it; `start_battle` goes straight to `Active`.
    Starting,
    Active,
    Finished,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Finished => "finished",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "starting" => Some(Self::Starting),
            "active" => Some(Self::Active),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Connected,
    Disconnected,
    /// Terminal for the rest of the room's life. A later submission
    /// overwrites the recorded result but never this status, and a
    /// disconnect never downgrades it.
    Submitted,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Submitted => "submitted",
        }
    }
}

/// One recorded judge result, as reported by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionResult {
    pub tests_passed: u32,
    pub tests_total: u32,
    pub elapsed_seconds: u64,
    pub submitted_at: DateTime<Utc>,
    pub code: String,
    pub language: String,
}

impl SubmissionResult {
    pub fn all_passed(&self) -> bool {
        self.tests_total > 0 && self.tests_passed == self.tests_total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub identity_id: Uuid,
    pub display_name: String,
    pub status: ParticipantStatus,
    pub tests_passed: Option<u32>,
    pub tests_total: Option<u32>,
    pub elapsed_seconds: Option<u64>,
}

/// Point-in-time view of a room, sent in acks and `room_update` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub host_id: Uuid,
    pub problem_id: Uuid,
    pub status: RoomStatus,
    pub duration_seconds: u32,
    pub capacity: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub participants: Vec<ParticipantInfo>,
}

/// What triggered a `room_update` broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomUpdateReason {
    PlayerJoined,
    PlayerLeft,
    BattleStarted,
    PlayerDisconnected,
}
