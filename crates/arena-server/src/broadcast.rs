use arena_common::protocol::{RoomEvent, ServerMessage};

use crate::room::RoomState;

/// Fans an event out to every connected participant of a room.
///
/// Callers hold the room's mutex, so per-room event order matches the
/// order of accepted operations. Sends are unbounded-channel enqueues
/// and never block; a closed channel means the connection is tearing
/// down and its own cleanup will mark the participant disconnected.
pub fn broadcast(room: &RoomState, event: RoomEvent) {
    let msg = ServerMessage::Event(event);
    for tx in room.connected_senders() {
        let _ = tx.send(msg.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RoomRow;
    use arena_common::room::RoomStatus;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_broadcast_reaches_all_connected_participants() {
        let host_id = Uuid::new_v4();
        let mut room = RoomState::from_row(&RoomRow {
            id: Uuid::new_v4(),
            host_id,
            problem_id: Uuid::new_v4(),
            status: RoomStatus::Waiting,
            duration_seconds: 60,
            capacity: 3,
            started_at: None,
            ends_at: None,
        });

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let other = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        room.join(host_id, "a".into(), Uuid::new_v4(), tx_a).unwrap();
        room.join(other, "b".into(), conn_b, tx_b).unwrap();

        broadcast(&room, RoomEvent::PlayerLeft { identity_id: other });
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerMessage::Event(RoomEvent::PlayerLeft { .. })
        ));
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerMessage::Event(RoomEvent::PlayerLeft { .. })
        ));

        // Disconnected participants have no sender and are skipped.
        room.disconnect(other, conn_b);
        broadcast(&room, RoomEvent::PlayerLeft { identity_id: other });
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
