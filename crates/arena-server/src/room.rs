use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use arena_common::error::RoomError;
use arena_common::leaderboard::{self, LeaderboardEntry, RankInput};
use arena_common::protocol::ServerMessage;
use arena_common::room::{
    ParticipantInfo, ParticipantStatus, RoomSnapshot, RoomStatus, SubmissionResult,
};

use crate::store::RoomRow;

/// Outbound channel to one live connection. Unbounded so that enqueueing
/// a broadcast under the room lock never awaits.
pub type OutboundTx = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
pub struct Participant {
    pub identity_id: Uuid,
    pub display_name: String,
    /// Current live transport handle; `None` while disconnected.
    pub connection_id: Option<Uuid>,
    pub status: ParticipantStatus,
    pub submission: Option<SubmissionResult>,
    pub tx: Option<OutboundTx>,
    /// Arrival order of the first submission, for residual tie-breaks.
    submit_seq: Option<u64>,
}

/// The authoritative in-memory model of one battle room. All methods are
/// synchronous; callers serialize access through the registry's per-room
/// mutex.
#[derive(Debug)]
pub struct RoomState {
    pub id: Uuid,
    pub host_id: Uuid,
    pub problem_id: Uuid,
    pub status: RoomStatus,
    pub duration_seconds: u32,
    pub capacity: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    participants: HashMap<Uuid, Participant>,
    join_order: Vec<Uuid>,
    next_submit_seq: u64,
    retired: bool,
}

#[derive(Debug)]
pub struct JoinOutcome {
    /// An existing participant reconnecting, as opposed to a new entry.
    pub rejoined: bool,
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub rank: u32,
    pub all_passed: bool,
    pub leaderboard: Vec<LeaderboardEntry>,
}

impl RoomState {
    /// Hydrates a minimal room from its durable row. Participants attach
    /// as they join; peers known only to the durable store reappear on
    /// their own reconnect.
    pub fn from_row(row: &RoomRow) -> Self {
        Self {
            id: row.id,
            host_id: row.host_id,
            problem_id: row.problem_id,
            status: row.status,
            duration_seconds: row.duration_seconds,
            capacity: row.capacity,
            started_at: row.started_at,
            ends_at: row.ends_at,
            participants: HashMap::new(),
            join_order: Vec::new(),
            next_submit_seq: 0,
            retired: false,
        }
    }

    /// Marks this state as dropped from the registry. A caller that
    /// still holds the `Arc` but not the lock must resolve the room
    /// again instead of mutating an orphan.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Inserts a new participant or reactivates an existing one (the
    /// reconnect path). Reconnects are accepted in any room status;
    /// new identities only while `Waiting` and under capacity.
    pub fn join(
        &mut self,
        identity_id: Uuid,
        display_name: String,
        connection_id: Uuid,
        tx: OutboundTx,
    ) -> Result<JoinOutcome, RoomError> {
        if let Some(p) = self.participants.get_mut(&identity_id) {
            p.display_name = display_name;
            p.connection_id = Some(connection_id);
            p.tx = Some(tx);
            // Submitted is terminal; everything else comes back connected.
            if p.status != ParticipantStatus::Submitted {
                p.status = ParticipantStatus::Connected;
            }
            return Ok(JoinOutcome { rejoined: true });
        }

        if self.participants.len() as u32 >= self.capacity {
            return Err(RoomError::RoomFull);
        }
        if self.status != RoomStatus::Waiting {
            return Err(RoomError::RoomAlreadyStarted);
        }

        self.participants.insert(
            identity_id,
            Participant {
                identity_id,
                display_name,
                connection_id: Some(connection_id),
                status: ParticipantStatus::Connected,
                submission: None,
                tx: Some(tx),
                submit_seq: None,
            },
        );
        self.join_order.push(identity_id);
        Ok(JoinOutcome { rejoined: false })
    }

    /// Voluntary exit: removes the participant entirely. Idempotent.
    /// Returns false when the identity was not in the room.
    pub fn leave(&mut self, identity_id: Uuid) -> bool {
        let removed = self.participants.remove(&identity_id).is_some();
        if removed {
            self.join_order.retain(|id| id != &identity_id);
        }
        removed
    }

    /// Precondition checks for `start_battle`, in contract order. No
    /// mutation: the transition commits only after the durable write.
    pub fn authorize_start(&self, caller: Uuid) -> Result<(), RoomError> {
        if caller != self.host_id {
            return Err(RoomError::NotHost);
        }
        if self.status != RoomStatus::Waiting {
            return Err(RoomError::RoomAlreadyStarted);
        }
        Ok(())
    }

    /// Deadline implied by a given start instant. Informational state:
    /// enforcement belongs to an external scheduler.
    pub fn planned_end(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        started_at + Duration::seconds(i64::from(self.duration_seconds))
    }

    /// Commits the `Waiting -> Active` transition. `started_at`/`ends_at`
    /// are set exactly once, here.
    pub fn commit_start(&mut self, started_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        debug_assert_eq!(self.status, RoomStatus::Waiting);
        let ends_at = self.planned_end(started_at);
        self.status = RoomStatus::Active;
        self.started_at = Some(started_at);
        self.ends_at = Some(ends_at);
        (started_at, ends_at)
    }

    /// Records a submission and recomputes the leaderboard. Repeat calls
    /// overwrite the recorded result; the participant stays `Submitted`
    /// and keeps their original arrival position.
    pub fn submit(
        &mut self,
        identity_id: Uuid,
        result: SubmissionResult,
    ) -> Result<SubmitOutcome, RoomError> {
        let seq = self.next_submit_seq;
        let p = self
            .participants
            .get_mut(&identity_id)
            .ok_or(RoomError::NotInRoom)?;

        let all_passed = result.all_passed();
        p.submission = Some(result);
        p.status = ParticipantStatus::Submitted;
        if p.submit_seq.is_none() {
            p.submit_seq = Some(seq);
            self.next_submit_seq += 1;
        }

        let leaderboard = self.leaderboard();
        // The caller was marked Submitted above, so leaderboard() must
        // include it; a miss is a ranking bug.
        let rank = leaderboard::rank_of(&leaderboard, identity_id).ok_or_else(|| {
            RoomError::Internal(format!("submitter {} missing from leaderboard", identity_id))
        })?;
        Ok(SubmitOutcome {
            rank,
            all_passed,
            leaderboard,
        })
    }

    /// Transport-driven disconnect. Applies only when the event carries
    /// the participant's current connection id; a stale id means the
    /// identity already reconnected elsewhere and the event is dropped.
    /// Returns whether anything changed.
    pub fn disconnect(&mut self, identity_id: Uuid, connection_id: Uuid) -> bool {
        let Some(p) = self.participants.get_mut(&identity_id) else {
            return false;
        };
        if p.connection_id != Some(connection_id) {
            return false;
        }
        p.connection_id = None;
        p.tx = None;
        if p.status != ParticipantStatus::Submitted {
            p.status = ParticipantStatus::Disconnected;
        }
        true
    }

    /// Terminal transition, owned by an external scheduler. Absorbing:
    /// calling it on a finished room is a no-op.
    pub fn finish(&mut self) {
        self.status = RoomStatus::Finished;
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participant(&self, identity_id: Uuid) -> Option<&Participant> {
        self.participants.get(&identity_id)
    }

    /// Outbound channels of every currently connected participant.
    pub fn connected_senders(&self) -> impl Iterator<Item = &OutboundTx> {
        self.join_order
            .iter()
            .filter_map(|id| self.participants.get(id))
            .filter_map(|p| p.tx.as_ref())
    }

    /// Derived ranking over the submitted subset, in submission-arrival
    /// order before sorting so residual ties stay stable.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut submitted: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.submit_seq.is_some() && p.submission.is_some())
            .collect();
        submitted.sort_by_key(|p| p.submit_seq);
        let inputs = submitted
            .into_iter()
            .filter_map(|p| {
                p.submission.as_ref().map(|s| RankInput {
                    identity_id: p.identity_id,
                    tests_passed: s.tests_passed,
                    tests_total: s.tests_total,
                    elapsed_seconds: s.elapsed_seconds,
                })
            })
            .collect();
        leaderboard::rank(inputs)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let participants = self
            .join_order
            .iter()
            .filter_map(|id| self.participants.get(id))
            .map(|p| ParticipantInfo {
                identity_id: p.identity_id,
                display_name: p.display_name.clone(),
                status: p.status,
                tests_passed: p.submission.as_ref().map(|s| s.tests_passed),
                tests_total: p.submission.as_ref().map(|s| s.tests_total),
                elapsed_seconds: p.submission.as_ref().map(|s| s.elapsed_seconds),
            })
            .collect();

        RoomSnapshot {
            room_id: self.id,
            host_id: self.host_id,
            problem_id: self.problem_id,
            status: self.status,
            duration_seconds: self.duration_seconds,
            capacity: self.capacity,
            started_at: self.started_at,
            ends_at: self.ends_at,
            participants,
        }
    }
}
