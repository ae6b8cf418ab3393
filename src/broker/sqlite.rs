//! Durable broker backend on `SQLite`
//!
//! Every operation runs on the blocking pool. Dequeue takes an immediate
//! transaction so two worker processes can never lease the same row.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use super::{Delivery, ResultStore, TaskQueue};
use crate::db::{DbConn, DbPool};
use crate::pipeline::{Destination, ResultStatus, SynthesisRequest, SynthesisResult, TaskId};
use crate::{Error, Result};

/// Unconsumed result row by task id, in `row_to_result` column order
const SELECT_LIVE_RESULT: &str = "
    SELECT task_id, room_id, channel_id, status, artifact_path, error, submitted_at, expires_at
    FROM results WHERE task_id = ?1 AND consumed = 0";

/// Broker backed by a shared `SQLite` database
#[derive(Debug, Clone)]
pub struct SqliteBroker {
    pool: DbPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl SqliteBroker {
    /// Create a broker over an initialized pool
    ///
    /// `poll_interval` paces blocking waits in [`TaskQueue::consume`] and
    /// [`ResultStore::wait_ready`], since other processes cannot signal us.
    #[must_use]
    pub const fn new(pool: DbPool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DbConn) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Database(format!("blocking task failed: {e}")))?
    }

    async fn try_lease(&self) -> Result<Option<Delivery>> {
        let visibility = duration_millis(self.visibility_timeout);
        self.blocking(move |conn| {
            let now = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    "SELECT id, room_id, channel_id, text, submitted_at, attempt FROM tasks
                     WHERE visible_at <= ?1 AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
                     ORDER BY visible_at, rowid LIMIT 1",
                    [now],
                    |row| Ok((row_to_request(row)?, row.get::<_, u32>(5)?)),
                )
                .optional()?;

            let Some((request, attempt)) = row else {
                return Ok(None);
            };

            let receipt = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE tasks SET receipt = ?1, lease_expires_at = ?2 WHERE id = ?3",
                params![receipt, now + visibility, request.id.as_str()],
            )?;
            tx.commit()?;

            Ok(Some(Delivery {
                request,
                attempt,
                receipt,
            }))
        })
        .await
    }

    async fn try_pop_ready(&self, destination: Destination) -> Result<Option<TaskId>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = tx
                .query_row(
                    "SELECT seq, task_id FROM ready_list
                     WHERE room_id = ?1 AND channel_id = ?2 ORDER BY seq LIMIT 1",
                    params![to_sql_id(destination.room_id), to_sql_id(destination.channel_id)],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            let Some((seq, task_id)) = row else {
                return Ok(None);
            };

            tx.execute("DELETE FROM ready_list WHERE seq = ?1", [seq])?;
            tx.commit()?;
            Ok(Some(TaskId::from(task_id)))
        })
        .await
    }
}

#[async_trait]
impl TaskQueue for SqliteBroker {
    async fn publish(&self, request: &SynthesisRequest) -> Result<()> {
        let request = request.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO tasks
                   (id, room_id, channel_id, text, submitted_at, attempt, visible_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    request.id.as_str(),
                    to_sql_id(request.destination.room_id),
                    to_sql_id(request.destination.channel_id),
                    request.text,
                    request.submitted_at.to_rfc3339(),
                    now_millis(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| Error::QueueUnavailable(e.to_string()))
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(delivery) = self.try_lease().await? {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let id = delivery.request.id.clone();
        let receipt = delivery.receipt.clone();
        let removed = self
            .blocking(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM tasks WHERE id = ?1 AND receipt = ?2",
                    params![id.as_str(), receipt],
                )?)
            })
            .await?;

        if removed == 0 {
            tracing::debug!(task_id = %delivery.request.id, "ack for stale lease ignored");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let id = delivery.request.id.clone();
        let receipt = delivery.receipt.clone();
        let attempt = delivery.attempt + 1;
        let delay = duration_millis(delay);
        let updated = self
            .blocking(move |conn| {
                Ok(conn.execute(
                    "UPDATE tasks
                     SET attempt = ?1, visible_at = ?2, receipt = NULL, lease_expires_at = NULL
                     WHERE id = ?3 AND receipt = ?4",
                    params![attempt, now_millis() + delay, id.as_str(), receipt],
                )?)
            })
            .await?;

        if updated == 0 {
            tracing::debug!(task_id = %delivery.request.id, "nack for stale lease ignored");
        }
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }
}

#[async_trait]
impl ResultStore for SqliteBroker {
    async fn put(&self, result: &SynthesisResult) -> Result<()> {
        let result = result.clone();
        self.blocking(move |conn| {
            conn.execute(
                r"INSERT INTO results (task_id, room_id, channel_id, status, artifact_path, error,
                                       submitted_at, expires_at, updated_at)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
                  ON CONFLICT(task_id) DO UPDATE SET
                    status = excluded.status,
                    artifact_path = excluded.artifact_path,
                    error = excluded.error,
                    submitted_at = excluded.submitted_at,
                    expires_at = excluded.expires_at,
                    updated_at = datetime('now')",
                params![
                    result.request_id.as_str(),
                    to_sql_id(result.destination.room_id),
                    to_sql_id(result.destination.channel_id),
                    result.status.as_str(),
                    result
                        .artifact_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    result.error,
                    result.submitted_at.timestamp_millis(),
                    result.expires_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &TaskId) -> Result<Option<SynthesisResult>> {
        let id = id.clone();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(SELECT_LIVE_RESULT, [id.as_str()], row_to_result)
                .optional()?)
        })
        .await
    }

    async fn take(&self, id: &TaskId) -> Result<Option<SynthesisResult>> {
        let id = id.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = tx
                .query_row(SELECT_LIVE_RESULT, [id.as_str()], row_to_result)
                .optional()?;

            if result.is_some() {
                tx.execute("UPDATE results SET consumed = 1 WHERE task_id = ?1", [id.as_str()])?;
            }
            tx.commit()?;

            Ok(result.map(|r| {
                if r.status != ResultStatus::Expired && r.is_expired_at(Utc::now()) {
                    r.into_expired()
                } else {
                    r
                }
            }))
        })
        .await
    }

    async fn is_consumed(&self, id: &TaskId) -> Result<bool> {
        let id = id.clone();
        self.blocking(move |conn| {
            let consumed = conn
                .query_row(
                    "SELECT consumed FROM results WHERE task_id = ?1",
                    [id.as_str()],
                    |row| row.get::<_, bool>(0),
                )
                .optional()?;
            Ok(consumed.unwrap_or(false))
        })
        .await
    }

    async fn delete(&self, id: &TaskId) -> Result<bool> {
        let id = id.clone();
        self.blocking(move |conn| {
            let deleted = conn.execute("DELETE FROM results WHERE task_id = ?1", [id.as_str()])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn notify_ready(&self, destination: Destination, id: &TaskId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO ready_list (room_id, channel_id, task_id) VALUES (?1, ?2, ?3)",
                params![
                    to_sql_id(destination.room_id),
                    to_sql_id(destination.channel_id),
                    id.as_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn wait_ready(
        &self,
        destination: Destination,
        timeout: Duration,
    ) -> Result<Option<TaskId>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(id) = self.try_pop_ready(destination).await? {
                return Ok(Some(id));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn close_destination(&self, destination: Destination) -> Result<usize> {
        self.blocking(move |conn| {
            let room = to_sql_id(destination.room_id);
            let channel = to_sql_id(destination.channel_id);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let cleared = tx.execute(
                "DELETE FROM ready_list WHERE room_id = ?1 AND channel_id = ?2",
                params![room, channel],
            )?;
            tx.execute(
                "INSERT INTO closed_destinations (room_id, channel_id, closed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(room_id, channel_id) DO UPDATE SET closed_at = excluded.closed_at",
                params![room, channel, now_millis()],
            )?;
            tx.commit()?;

            Ok(cleared)
        })
        .await
    }

    async fn closed_at(&self, destination: Destination) -> Result<Option<DateTime<Utc>>> {
        self.blocking(move |conn| {
            let closed_at = conn
                .query_row(
                    "SELECT closed_at FROM closed_destinations
                     WHERE room_id = ?1 AND channel_id = ?2",
                    params![
                        to_sql_id(destination.room_id),
                        to_sql_id(destination.channel_id)
                    ],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(closed_at.and_then(DateTime::from_timestamp_millis))
        })
        .await
    }

    async fn purge_expired(&self) -> Result<Vec<SynthesisResult>> {
        self.blocking(|conn| {
            let now = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let expired = {
                let mut stmt = tx.prepare(
                    "SELECT task_id, room_id, channel_id, status, artifact_path, error,
                            submitted_at, expires_at
                     FROM results WHERE expires_at <= ?1 AND consumed = 0",
                )?;
                stmt.query_map([now], row_to_result)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            tx.execute("DELETE FROM results WHERE expires_at <= ?1", [now])?;
            tx.commit()?;

            Ok(expired
                .into_iter()
                .map(SynthesisResult::into_expired)
                .collect())
        })
        .await
    }

    async fn purge_dangling_ready(&self) -> Result<usize> {
        self.blocking(|conn| {
            Ok(conn.execute(
                "DELETE FROM ready_list WHERE task_id NOT IN
                   (SELECT task_id FROM results WHERE consumed = 0)",
                [],
            )?)
        })
        .await
    }
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<SynthesisRequest> {
    let submitted_at: String = row.get(4)?;
    Ok(SynthesisRequest {
        id: TaskId::from(row.get::<_, String>(0)?),
        destination: Destination::new(from_sql_id(row.get(1)?), from_sql_id(row.get(2)?)),
        text: row.get(3)?,
        submitted_at: DateTime::parse_from_rfc3339(&submitted_at)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
    })
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<SynthesisResult> {
    let status: String = row.get(3)?;
    let status = ResultStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown result status: {status}").into(),
        )
    })?;

    Ok(SynthesisResult {
        request_id: TaskId::from(row.get::<_, String>(0)?),
        destination: Destination::new(from_sql_id(row.get(1)?), from_sql_id(row.get(2)?)),
        status,
        artifact_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        error: row.get(5)?,
        submitted_at: DateTime::from_timestamp_millis(row.get(6)?).unwrap_or_default(),
        expires_at: DateTime::from_timestamp_millis(row.get(7)?).unwrap_or_default(),
    })
}

/// Platform ids are 64-bit unsigned; `SQLite` integers are signed. The bit
/// pattern is stored as-is and reinterpreted on the way out.
#[allow(clippy::cast_possible_wrap)]
const fn to_sql_id(id: u64) -> i64 {
    id as i64
}

#[allow(clippy::cast_sign_loss)]
const fn from_sql_id(id: i64) -> u64 {
    id as u64
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
