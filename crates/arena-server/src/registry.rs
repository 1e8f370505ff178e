use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use arena_common::error::RoomError;

use crate::room::RoomState;
use crate::store::RoomStore;

/// Shared handle to one room's state. The mutex serializes all logical
/// operations on that room; operations on different rooms never contend.
pub type SharedRoom = Arc<Mutex<RoomState>>;

/// Process-local map of live rooms. The outer lock covers insertion and
/// lookup only, never room contents. Authoritative for this process's
/// lifetime, reconstructible from the durable store at any time.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, SharedRoom>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<SharedRoom> {
        self.rooms.read().await.get(&id).cloned()
    }

    /// Lookup with hydrate-on-first-reference: a room unseen by this
    /// process is loaded from its durable row. `RoomNotFound` means the
    /// durable lookup failed too.
    pub async fn get_or_hydrate(
        &self,
        id: Uuid,
        store: &dyn RoomStore,
    ) -> Result<SharedRoom, RoomError> {
        if let Some(room) = self.get(id).await {
            return Ok(room);
        }

        // Durable lookup happens before taking the write lock.
        let row = store
            .fetch_room(id)
            .await
            .map_err(|e| RoomError::Storage(e.to_string()))?
            .ok_or(RoomError::RoomNotFound)?;

        let mut rooms = self.rooms.write().await;
        // A concurrent join may have hydrated while we were fetching.
        if let Some(room) = rooms.get(&id) {
            return Ok(room.clone());
        }
        tracing::info!("Hydrating room {} from durable store", id);
        let room = Arc::new(Mutex::new(RoomState::from_row(&row)));
        rooms.insert(id, room.clone());
        Ok(room)
    }

    /// Drops the registry entry once its participant set is empty. The
    /// durable row is untouched. A room whose mutex is held right now is
    /// mid-operation and left for the next prune.
    ///
    /// The state is retired before the entry is removed, so a joiner
    /// that already cloned the `Arc` but has not locked it yet sees the
    /// flag and resolves the room again instead of mutating an orphan.
    pub async fn remove_if_empty(&self, id: Uuid) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(&id) {
            Some(room) => match room.try_lock() {
                Ok(mut state) => {
                    if state.is_empty() {
                        state.retire();
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            },
            None => return,
        };
        if empty {
            tracing::info!("Dropping empty room {} from registry", id);
            rooms.remove(&id);
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
