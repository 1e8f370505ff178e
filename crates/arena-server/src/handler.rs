use chrono::Utc;
use uuid::Uuid;

use arena_common::error::{ErrorReply, RoomError};
use arena_common::protocol::{AckBody, RequestBody, RoomEvent, ServerMessage};
use arena_common::room::{RoomUpdateReason, SubmissionResult};

use crate::broadcast::broadcast;
use crate::connection::ConnectionCtx;
use crate::server::SharedState;

/// Dispatches one request and acks it exactly once. Failures travel
/// through the ack, never the broadcast channel. Returns whether the
/// request was acked as a success, so the connection can track which
/// room memberships actually took effect.
pub async fn handle_request(
    ctx: &ConnectionCtx,
    seq: u64,
    body: RequestBody,
    state: &SharedState,
) -> bool {
    let name = body.name();
    let result = dispatch(ctx, body, state).await;
    if let Err(e) = &result {
        tracing::debug!("{} from {} failed: {}", name, ctx.identity.id, e);
    }
    let acked_ok = result.is_ok();
    let result = result.map_err(|e| ErrorReply::from(&e));
    let _ = ctx.tx.send(ServerMessage::Ack { seq, result });
    acked_ok
}

async fn dispatch(
    ctx: &ConnectionCtx,
    body: RequestBody,
    state: &SharedState,
) -> Result<AckBody, RoomError> {
    match body {
        RequestBody::JoinRoom {
            room_id,
            display_name,
        } => join_room(ctx, state, room_id, display_name).await,
        RequestBody::LeaveRoom { room_id } => leave_room(ctx, state, room_id).await,
        RequestBody::StartBattle { room_id } => start_battle(ctx, state, room_id).await,
        RequestBody::SubmitCode {
            room_id,
            code,
            language,
            tests_passed,
            total_tests,
            time_taken,
        } => {
            let result = SubmissionResult {
                tests_passed,
                tests_total: total_tests,
                elapsed_seconds: time_taken,
                submitted_at: Utc::now(),
                code,
                language,
            };
            submit_code(ctx, state, room_id, result).await
        }
    }
}

async fn join_room(
    ctx: &ConnectionCtx,
    state: &SharedState,
    room_id: Uuid,
    display_name: String,
) -> Result<AckBody, RoomError> {
    let identity_id = ctx.identity.id;
    let mut room = loop {
        let shared = state
            .registry
            .get_or_hydrate(room_id, state.store.as_ref())
            .await?;
        let room = shared.lock_owned().await;
        // The empty-room prune may have retired this state between the
        // registry lookup and taking the lock. Joining it would strand
        // the participant in an orphan, so resolve the room again.
        if !room.is_retired() {
            break room;
        }
    };

    let outcome = room.join(
        identity_id,
        display_name.clone(),
        ctx.connection_id,
        ctx.tx.clone(),
    )?;
    if outcome.rejoined {
        tracing::info!("Identity {} reconnected to room {}", identity_id, room_id);
    } else {
        tracing::info!("Identity {} joined room {}", identity_id, room_id);
    }

    // Write-through is off the broadcast path: failures are logged, the
    // in-memory state stays the real-time source of truth.
    let status = room
        .participant(identity_id)
        .map(|p| p.status)
        .unwrap_or(arena_common::room::ParticipantStatus::Connected);
    let store = state.store.clone();
    let name_for_store = display_name.clone();
    tokio::spawn(async move {
        if let Err(e) = store
            .upsert_participant(room_id, identity_id, &name_for_store, status)
            .await
        {
            tracing::warn!("Participant upsert for room {} failed: {}", room_id, e);
        }
    });

    // Two broadcasts on purpose: player_joined drives transient UI,
    // room_update drives steady-state rendering.
    broadcast(
        &room,
        RoomEvent::PlayerJoined {
            identity_id,
            display_name,
        },
    );
    let snapshot = room.snapshot();
    broadcast(
        &room,
        RoomEvent::RoomUpdate {
            reason: RoomUpdateReason::PlayerJoined,
            room: snapshot.clone(),
        },
    );

    Ok(AckBody::RoomJoined { room: snapshot })
}

/// Voluntary exit. Always acks success, even for rooms the caller never
/// joined.
async fn leave_room(
    ctx: &ConnectionCtx,
    state: &SharedState,
    room_id: Uuid,
) -> Result<AckBody, RoomError> {
    let identity_id = ctx.identity.id;
    let Some(shared) = state.registry.get(room_id).await else {
        return Ok(AckBody::RoomLeft);
    };

    let mut room = shared.lock().await;
    if !room.leave(identity_id) {
        return Ok(AckBody::RoomLeft);
    }
    tracing::info!("Identity {} left room {}", identity_id, room_id);

    broadcast(&room, RoomEvent::PlayerLeft { identity_id });
    broadcast(
        &room,
        RoomEvent::RoomUpdate {
            reason: RoomUpdateReason::PlayerLeft,
            room: room.snapshot(),
        },
    );
    let empty = room.is_empty();
    drop(room);

    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store
            .mark_participant_left(room_id, identity_id, Utc::now())
            .await
        {
            tracing::warn!("Left-mark for room {} failed: {}", room_id, e);
        }
    });

    // Registry entry goes the instant the room empties; the durable row
    // stays as the system of record.
    if empty {
        state.registry.remove_if_empty(room_id).await;
    }

    Ok(AckBody::RoomLeft)
}

async fn start_battle(
    ctx: &ConnectionCtx,
    state: &SharedState,
    room_id: Uuid,
) -> Result<AckBody, RoomError> {
    let shared = state
        .registry
        .get(room_id)
        .await
        .ok_or(RoomError::RoomNotFound)?;
    let mut room = shared.lock().await;

    room.authorize_start(ctx.identity.id)?;
    let started_at = Utc::now();
    let ends_at = room.planned_end(started_at);

    // The one synchronous durable write: other processes trust the
    // durable active flag, so failure aborts the whole transition.
    state
        .store
        .mark_started(room_id, started_at, ends_at)
        .await
        .map_err(|e| RoomError::Storage(e.to_string()))?;

    room.commit_start(started_at);
    tracing::info!(
        "Battle {} started by {} (ends {})",
        room_id,
        ctx.identity.id,
        ends_at
    );

    broadcast(
        &room,
        RoomEvent::BattleStarted {
            room_id,
            start_time: started_at,
            end_time: ends_at,
        },
    );
    broadcast(
        &room,
        RoomEvent::RoomUpdate {
            reason: RoomUpdateReason::BattleStarted,
            room: room.snapshot(),
        },
    );

    Ok(AckBody::BattleStarted)
}

async fn submit_code(
    ctx: &ConnectionCtx,
    state: &SharedState,
    room_id: Uuid,
    result: SubmissionResult,
) -> Result<AckBody, RoomError> {
    let identity_id = ctx.identity.id;
    let shared = state
        .registry
        .get(room_id)
        .await
        .ok_or(RoomError::RoomNotFound)?;
    let mut room = shared.lock().await;

    let outcome = room.submit(identity_id, result.clone())?;
    tracing::info!(
        "Identity {} submitted in room {} ({}/{} in {}s, rank {})",
        identity_id,
        room_id,
        result.tests_passed,
        result.tests_total,
        result.elapsed_seconds,
        outcome.rank
    );

    broadcast(
        &room,
        RoomEvent::SubmissionBroadcast {
            identity_id,
            tests_passed: result.tests_passed,
            total_tests: result.tests_total,
            time_taken: result.elapsed_seconds,
            rank: outcome.rank,
            all_passed: outcome.all_passed,
        },
    );
    broadcast(
        &room,
        RoomEvent::LeaderboardUpdate {
            entries: outcome.leaderboard,
        },
    );
    drop(room);

    // Latest result on the participant row plus an immutable history
    // row, both fire-and-forget.
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.record_result(room_id, identity_id, &result).await {
            tracing::warn!("Result write for room {} failed: {}", room_id, e);
        }
        if let Err(e) = store.append_submission(room_id, identity_id, &result).await {
            tracing::warn!("Submission append for room {} failed: {}", room_id, e);
        }
    });

    Ok(AckBody::SubmissionRanked { rank: outcome.rank })
}

/// Transport-driven disconnect, invoked by the connection's cleanup
/// path rather than the client. Keeps the participant entry so a rejoin
/// restores prior submission state.
pub async fn handle_disconnect(room_id: Uuid, ctx: &ConnectionCtx, state: &SharedState) {
    let Some(shared) = state.registry.get(room_id).await else {
        return;
    };
    let mut room = shared.lock().await;

    if !room.disconnect(ctx.identity.id, ctx.connection_id) {
        // Stale event: the identity already reconnected elsewhere.
        return;
    }
    tracing::info!(
        "Identity {} disconnected from room {}",
        ctx.identity.id,
        room_id
    );

    broadcast(
        &room,
        RoomEvent::RoomUpdate {
            reason: RoomUpdateReason::PlayerDisconnected,
            room: room.snapshot(),
        },
    );

    if let Some(p) = room.participant(ctx.identity.id) {
        let store = state.store.clone();
        let identity_id = ctx.identity.id;
        let display_name = p.display_name.clone();
        let status = p.status;
        tokio::spawn(async move {
            if let Err(e) = store
                .upsert_participant(room_id, identity_id, &display_name, status)
                .await
            {
                tracing::warn!("Disconnect upsert for room {} failed: {}", room_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, InsecureVerifier};
    use crate::server::ServerState;
    use crate::store::{MemoryStore, RoomRow, RoomStore};
    use arena_common::error::ErrorCode;
    use arena_common::room::{ParticipantStatus, RoomStatus};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct TestConn {
        ctx: ConnectionCtx,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    fn conn() -> TestConn {
        let (tx, rx) = mpsc::unbounded_channel();
        TestConn {
            ctx: ConnectionCtx {
                connection_id: Uuid::new_v4(),
                identity: Identity { id: Uuid::new_v4() },
                tx,
            },
            rx,
        }
    }

    async fn state_with_room(capacity: u32) -> (SharedState, Arc<MemoryStore>, Uuid, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let row = RoomRow {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            problem_id: Uuid::new_v4(),
            status: RoomStatus::Waiting,
            duration_seconds: 600,
            capacity,
            started_at: None,
            ends_at: None,
        };
        let room_id = row.id;
        let host_id = row.host_id;
        store.insert_room(row).await;
        let state = ServerState::new(store.clone(), Arc::new(InsecureVerifier), 16);
        (state, store, room_id, host_id)
    }

    async fn next_ack(conn: &mut TestConn) -> (u64, Result<AckBody, ErrorReply>) {
        loop {
            match conn.rx.recv().await.expect("connection channel closed") {
                ServerMessage::Ack { seq, result } => return (seq, result),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_join_acks_with_snapshot() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        let (seq, result) = next_ack(&mut c).await;
        assert_eq!(seq, 1);
        match result.unwrap() {
            AckBody::RoomJoined { room } => {
                assert_eq!(room.room_id, room_id);
                assert_eq!(room.participants.len(), 1);
            }
            _ => panic!("wrong ack body"),
        }
    }

    #[tokio::test]
    async fn test_join_unknown_room_acks_not_found() {
        let (state, _store, _, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id: Uuid::new_v4(),
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        let (_, result) = next_ack(&mut c).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::RoomNotFound);
    }

    #[tokio::test]
    async fn test_full_room_acks_room_full() {
        let (state, _store, room_id, _) = state_with_room(1).await;
        let mut first = conn();
        handle_request(
            &first.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        assert!(next_ack(&mut first).await.1.is_ok());

        let mut second = conn();
        handle_request(
            &second.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Bob".into(),
            },
            &state,
        )
        .await;
        let (_, result) = next_ack(&mut second).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::RoomFull);
    }

    #[tokio::test]
    async fn test_leave_always_acks_success() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(&c.ctx, 9, RequestBody::LeaveRoom { room_id }, &state).await;
        let (seq, result) = next_ack(&mut c).await;
        assert_eq!(seq, 9);
        assert!(matches!(result.unwrap(), AckBody::RoomLeft));
    }

    #[tokio::test]
    async fn test_leave_of_last_participant_drops_registry_entry() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut c).await.1.unwrap();
        assert_eq!(state.registry.len().await, 1);

        handle_request(&c.ctx, 2, RequestBody::LeaveRoom { room_id }, &state).await;
        next_ack(&mut c).await.1.unwrap();
        assert_eq!(state.registry.len().await, 0);

        // Durable row survives; the room hydrates again on re-join.
        handle_request(
            &c.ctx,
            3,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        assert!(next_ack(&mut c).await.1.is_ok());
    }

    #[tokio::test]
    async fn test_start_by_non_host_acks_not_host() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut c).await.1.unwrap();

        handle_request(&c.ctx, 2, RequestBody::StartBattle { room_id }, &state).await;
        let (_, result) = next_ack(&mut c).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::NotHost);
    }

    #[tokio::test]
    async fn test_start_flips_durable_status_before_acking() {
        let store = Arc::new(MemoryStore::new());
        let host_id = Uuid::new_v4();
        let row = RoomRow {
            id: Uuid::new_v4(),
            host_id,
            problem_id: Uuid::new_v4(),
            status: RoomStatus::Waiting,
            duration_seconds: 600,
            capacity: 4,
            started_at: None,
            ends_at: None,
        };
        let room_id = row.id;
        store.insert_room(row).await;
        let state = ServerState::new(store.clone(), Arc::new(InsecureVerifier), 16);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut host = TestConn {
            ctx: ConnectionCtx {
                connection_id: Uuid::new_v4(),
                identity: Identity { id: host_id },
                tx,
            },
            rx,
        };

        handle_request(
            &host.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Host".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut host).await.1.unwrap();

        handle_request(&host.ctx, 2, RequestBody::StartBattle { room_id }, &state).await;
        let (_, result) = next_ack(&mut host).await;
        assert!(matches!(result.unwrap(), AckBody::BattleStarted));

        let durable = store.fetch_room(room_id).await.unwrap().unwrap();
        assert_eq!(durable.status, RoomStatus::Active);
        assert!(durable.started_at.is_some());

        // Second start fails and the timestamps stay untouched.
        handle_request(&host.ctx, 3, RequestBody::StartBattle { room_id }, &state).await;
        let (_, result) = next_ack(&mut host).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::RoomAlreadyStarted);
    }

    #[tokio::test]
    async fn test_submit_acks_rank_and_persists_history() {
        let (state, store, room_id, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut c).await.1.unwrap();

        handle_request(
            &c.ctx,
            2,
            RequestBody::SubmitCode {
                room_id,
                code: "pass".into(),
                language: "python".into(),
                tests_passed: 3,
                total_tests: 5,
                time_taken: 120,
            },
            &state,
        )
        .await;
        let (_, result) = next_ack(&mut c).await;
        match result.unwrap() {
            AckBody::SubmissionRanked { rank } => assert_eq!(rank, 1),
            _ => panic!("wrong ack body"),
        }

        // Fire-and-forget writes land shortly after the ack.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.submission_count(room_id).await, 1);
        let record = store
            .participant(room_id, c.ctx.identity.id)
            .await
            .unwrap();
        assert_eq!(record.status, ParticipantStatus::Submitted);
        assert_eq!(record.latest_result.unwrap().tests_passed, 3);
    }

    #[tokio::test]
    async fn test_submit_without_joining_acks_not_in_room() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut joiner = conn();
        handle_request(
            &joiner.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut joiner).await.1.unwrap();

        let mut outsider = conn();
        handle_request(
            &outsider.ctx,
            1,
            RequestBody::SubmitCode {
                room_id,
                code: String::new(),
                language: "rust".into(),
                tests_passed: 0,
                total_tests: 5,
                time_taken: 10,
            },
            &state,
        )
        .await;
        let (_, result) = next_ack(&mut outsider).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::NotInRoom);
    }

    #[tokio::test]
    async fn test_join_broadcasts_player_joined_then_room_update() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut first = conn();
        handle_request(
            &first.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        // Drain the joiner's own ack and events.
        next_ack(&mut first).await.1.unwrap();
        while first.rx.try_recv().is_ok() {}

        let mut second = conn();
        handle_request(
            &second.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Bob".into(),
            },
            &state,
        )
        .await;

        // First participant sees player_joined, then room_update.
        match first.rx.recv().await.unwrap() {
            ServerMessage::Event(RoomEvent::PlayerJoined { display_name, .. }) => {
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected player_joined, got {:?}", other),
        }
        match first.rx.recv().await.unwrap() {
            ServerMessage::Event(RoomEvent::RoomUpdate { reason, room }) => {
                assert_eq!(reason, RoomUpdateReason::PlayerJoined);
                assert_eq!(room.participants.len(), 2);
            }
            other => panic!("expected room_update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_racing_empty_prune_lands_in_registered_room() {
        let (state, _store, room_id, _) = state_with_room(4).await;

        // Interleave the join path with the prune: the joiner resolves
        // the room, then the last-leaver's prune retires and drops it
        // before the joiner gets the room lock.
        let stale = state
            .registry
            .get_or_hydrate(room_id, state.store.as_ref())
            .await
            .unwrap();
        state.registry.remove_if_empty(room_id).await;
        assert!(stale.lock().await.is_retired());

        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut c).await.1.unwrap();

        // The participant landed in a state the registry knows about,
        // not in the retired orphan.
        let shared = state.registry.get(room_id).await.unwrap();
        assert!(!Arc::ptr_eq(&shared, &stale));
        assert!(shared
            .lock()
            .await
            .participant(c.ctx.identity.id)
            .is_some());
        assert!(stale.lock().await.is_empty());

        // Follow-up requests keep working against the same room.
        handle_request(
            &c.ctx,
            2,
            RequestBody::SubmitCode {
                room_id,
                code: "x".into(),
                language: "rust".into(),
                tests_passed: 1,
                total_tests: 5,
                time_taken: 30,
            },
            &state,
        )
        .await;
        assert!(next_ack(&mut c).await.1.is_ok());
    }

    #[tokio::test]
    async fn test_handle_request_reports_ack_outcome() {
        let (state, _store, room_id, _) = state_with_room(1).await;
        let mut first = conn();
        let ok = handle_request(
            &first.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        assert!(ok);

        let mut second = conn();
        let ok = handle_request(
            &second.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Bob".into(),
            },
            &state,
        )
        .await;
        assert!(!ok);
        assert_eq!(
            next_ack(&mut second).await.1.unwrap_err().code,
            ErrorCode::RoomFull
        );
        drop(first);
    }

    #[tokio::test]
    async fn test_disconnect_marks_participant_and_keeps_entry() {
        let (state, _store, room_id, _) = state_with_room(4).await;
        let mut c = conn();
        handle_request(
            &c.ctx,
            1,
            RequestBody::JoinRoom {
                room_id,
                display_name: "Alice".into(),
            },
            &state,
        )
        .await;
        next_ack(&mut c).await.1.unwrap();

        handle_disconnect(room_id, &c.ctx, &state).await;

        let shared = state.registry.get(room_id).await.unwrap();
        let room = shared.lock().await;
        let p = room.participant(c.ctx.identity.id).unwrap();
        assert_eq!(p.status, ParticipantStatus::Disconnected);
        assert!(p.connection_id.is_none());
        // Disconnect is not leave: the room keeps the participant.
        assert!(!room.is_empty());
    }
}
