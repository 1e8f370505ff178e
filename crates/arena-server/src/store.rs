use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use arena_common::room::{ParticipantStatus, RoomStatus, SubmissionResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("room row has invalid status '{0}'")]
    InvalidStatus(String),
}

/// Durable room row, as registered out-of-band before anyone joins.
#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: Uuid,
    pub host_id: Uuid,
    pub problem_id: Uuid,
    pub status: RoomStatus,
    pub duration_seconds: u32,
    pub capacity: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// The durable-store collaborator. The in-memory registry is a cache on
/// top of this; rooms hydrate from here on first reference and the rows
/// outlive every process.
///
/// All writes except `mark_started` are fire-and-forget from the
/// caller's point of view: the handler spawns them and logs failures.
/// `mark_started` is the one write on the critical path, because peer
/// processes trust the durably-flagged active status.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn fetch_room(&self, id: Uuid) -> Result<Option<RoomRow>, StoreError>;

    async fn mark_started(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn upsert_participant(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        display_name: &str,
        status: ParticipantStatus,
    ) -> Result<(), StoreError>;

    async fn mark_participant_left(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Latest-result fields on the mutable participant row.
    async fn record_result(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError>;

    /// Append-only history; one row per submit_code call, never updated.
    async fn append_submission(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError>;
}

// -- Postgres --

/// The numeric submission columns are bigint, so u32 counts widen
/// losslessly. elapsed_seconds is u64 at the edge and clamps rather
/// than wrapping negative.
fn elapsed_column(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomStore for PgStore {
    async fn fetch_room(&self, id: Uuid) -> Result<Option<RoomRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, host_id, problem_id, status, duration_seconds, capacity, \
                    started_at, ends_at \
             FROM battle_rooms WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let status =
            RoomStatus::from_str(&status).ok_or_else(|| StoreError::InvalidStatus(status))?;
        Ok(Some(RoomRow {
            id: row.try_get("id")?,
            host_id: row.try_get("host_id")?,
            problem_id: row.try_get("problem_id")?,
            status,
            duration_seconds: row.try_get::<i32, _>("duration_seconds")? as u32,
            capacity: row.try_get::<i32, _>("capacity")? as u32,
            started_at: row.try_get("started_at")?,
            ends_at: row.try_get("ends_at")?,
        }))
    }

    async fn mark_started(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE battle_rooms \
             SET status = 'active', started_at = $2, ends_at = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(started_at)
        .bind(ends_at)
        .execute(&mut *tx)
        .await?;
        // Change notification so peer processes observe the flip without
        // polling.
        sqlx::query("SELECT pg_notify('battle_rooms', $1)")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_participant(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        display_name: &str,
        status: ParticipantStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO battle_participants \
                 (room_id, identity_id, display_name, status, joined_at, left_at) \
             VALUES ($1, $2, $3, $4, now(), NULL) \
             ON CONFLICT (room_id, identity_id) DO UPDATE \
             SET display_name = $3, status = $4, left_at = NULL",
        )
        .bind(room_id)
        .bind(identity_id)
        .bind(display_name)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_participant_left(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE battle_participants SET left_at = $3 \
             WHERE room_id = $1 AND identity_id = $2",
        )
        .bind(room_id)
        .bind(identity_id)
        .bind(left_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_result(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE battle_participants \
             SET status = 'submitted', tests_passed = $3, tests_total = $4, \
                 elapsed_seconds = $5, submitted_at = $6 \
             WHERE room_id = $1 AND identity_id = $2",
        )
        .bind(room_id)
        .bind(identity_id)
        .bind(i64::from(result.tests_passed))
        .bind(i64::from(result.tests_total))
        .bind(elapsed_column(result.elapsed_seconds))
        .bind(result.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_submission(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO battle_submissions \
                 (room_id, identity_id, code, language, tests_passed, tests_total, \
                  elapsed_seconds, submitted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(room_id)
        .bind(identity_id)
        .bind(&result.code)
        .bind(&result.language)
        .bind(i64::from(result.tests_passed))
        .bind(i64::from(result.tests_total))
        .bind(elapsed_column(result.elapsed_seconds))
        .bind(result.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// -- In-memory --

#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub identity_id: Uuid,
    pub display_name: String,
    pub status: ParticipantStatus,
    pub left_at: Option<DateTime<Utc>>,
    pub latest_result: Option<SubmissionResult>,
}

#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub room_id: Uuid,
    pub identity_id: Uuid,
    pub result: SubmissionResult,
}

/// Store for tests and storeless dev runs. Same contract as Postgres,
/// backed by maps.
#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<Uuid, RoomRow>>,
    participants: Mutex<HashMap<(Uuid, Uuid), ParticipantRecord>>,
    submissions: Mutex<Vec<SubmissionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a durable room row, standing in for the external
    /// registration flow that creates rooms before anyone joins.
    pub async fn insert_room(&self, row: RoomRow) {
        self.rooms.lock().await.insert(row.id, row);
    }

    pub async fn submission_count(&self, room_id: Uuid) -> usize {
        self.submissions
            .lock()
            .await
            .iter()
            .filter(|s| s.room_id == room_id)
            .count()
    }

    pub async fn participant(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
    ) -> Option<ParticipantRecord> {
        self.participants
            .lock()
            .await
            .get(&(room_id, identity_id))
            .cloned()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn fetch_room(&self, id: Uuid) -> Result<Option<RoomRow>, StoreError> {
        Ok(self.rooms.lock().await.get(&id).cloned())
    }

    async fn mark_started(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.get_mut(&id).ok_or(sqlx::Error::RowNotFound)?;
        room.status = RoomStatus::Active;
        room.started_at = Some(started_at);
        room.ends_at = Some(ends_at);
        Ok(())
    }

    async fn upsert_participant(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        display_name: &str,
        status: ParticipantStatus,
    ) -> Result<(), StoreError> {
        let mut participants = self.participants.lock().await;
        participants
            .entry((room_id, identity_id))
            .and_modify(|p| {
                p.display_name = display_name.to_string();
                p.status = status;
                p.left_at = None;
            })
            .or_insert_with(|| ParticipantRecord {
                identity_id,
                display_name: display_name.to_string(),
                status,
                left_at: None,
                latest_result: None,
            });
        Ok(())
    }

    async fn mark_participant_left(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(p) = self
            .participants
            .lock()
            .await
            .get_mut(&(room_id, identity_id))
        {
            p.left_at = Some(left_at);
        }
        Ok(())
    }

    async fn record_result(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        if let Some(p) = self
            .participants
            .lock()
            .await
            .get_mut(&(room_id, identity_id))
        {
            p.status = ParticipantStatus::Submitted;
            p.latest_result = Some(result.clone());
        }
        Ok(())
    }

    async fn append_submission(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        self.submissions.lock().await.push(SubmissionRecord {
            room_id,
            identity_id,
            result: result.clone(),
        });
        Ok(())
    }
}
