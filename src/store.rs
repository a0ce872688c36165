use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::format_timestamp;
use crate::errors::AppResult;
use crate::geo::Coordinate;

const PLACE_COLUMNS: &str =
    "id, name, lat, lon, created_at, last_seen_at, confirmations, bearing";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceRecord {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub created_at: Option<String>,
    pub last_seen_at: Option<String>,
    pub confirmations: i64,
    pub bearing: Option<f64>,
}

impl PlaceRecord {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }

    pub fn reference_timestamp(&self) -> Option<&str> {
        non_blank(&self.last_seen_at).or_else(|| non_blank(&self.created_at))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "place", rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted(PlaceRecord),
    Updated(PlaceRecord),
}

impl MergeOutcome {
    pub fn record(&self) -> &PlaceRecord {
        match self {
            MergeOutcome::Inserted(record) | MergeOutcome::Updated(record) => record,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.commit_retries.max(1),
            base_delay: config.commit_base_delay(),
        }
    }

    // `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            base_delay: Duration::from_millis(200),
        }
    }
}

// `op` must leave no partial writes behind when it fails.
pub async fn commit_with_retry<T, F>(
    db: &Mutex<Connection>,
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut(&mut Connection) -> AppResult<T> + Send,
    T: Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = {
            let mut conn = db.lock();
            op(&mut conn)
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    ?err,
                    attempt,
                    operation,
                    "store commit failed; retrying after {:?}",
                    delay
                );
                sleep(delay).await;
            }
            Err(err) => {
                warn!(?err, attempt, operation, "store commit failed; giving up");
                return Err(err);
            }
        }
    }
}

#[derive(Clone)]
pub struct PlaceStore {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl PlaceStore {
    pub fn new(db: Arc<Mutex<Connection>>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    // Matches the oldest record whose name contains `name`, not the reverse.
    pub async fn merge(
        &self,
        name: &str,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) -> AppResult<MergeOutcome> {
        let now = format_timestamp(now);
        let outcome = commit_with_retry(&self.db, self.retry, "merge", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = match find_by_name_substring_in(&tx, name)? {
                Some(existing) => {
                    tx.execute(
                        "UPDATE places
                        SET lat = ?1,
                            lon = ?2,
                            last_seen_at = MAX(?3, COALESCE(created_at, ?3)),
                            confirmations = COALESCE(confirmations, 1) + 1
                        WHERE id = ?4",
                        params![coordinate.lat, coordinate.lon, now, existing.id],
                    )?;
                    MergeOutcome::Updated(load_in(&tx, existing.id)?)
                }
                None => {
                    tx.execute(
                        "INSERT INTO places
                            (name, lat, lon, created_at, last_seen_at, confirmations, bearing)
                        VALUES (?1, ?2, ?3, ?4, ?4, 1, NULL)",
                        params![name, coordinate.lat, coordinate.lon, now],
                    )?;
                    let id = tx.last_insert_rowid();
                    MergeOutcome::Inserted(load_in(&tx, id)?)
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await?;

        match &outcome {
            MergeOutcome::Inserted(record) => {
                info!(id = record.id, name = %record.name, "place inserted")
            }
            MergeOutcome::Updated(record) => info!(
                id = record.id,
                name = %record.name,
                confirmations = record.confirmations,
                "place confirmed"
            ),
        }
        Ok(outcome)
    }

    pub fn find_by_name_substring(&self, name: &str) -> AppResult<Option<PlaceRecord>> {
        let conn = self.db.lock();
        find_by_name_substring_in(&conn, name)
    }

    pub fn get(&self, id: i64) -> AppResult<Option<PlaceRecord>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = ?1"),
            [id],
            place_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_all(&self) -> AppResult<Vec<PlaceRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLACE_COLUMNS} FROM places ORDER BY id DESC"
        ))?;
        let rows = stmt
            .query_map([], place_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn delete(&self, id: i64) -> AppResult<bool> {
        commit_with_retry(&self.db, self.retry, "delete", |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM places WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn clear(&self) -> AppResult<usize> {
        commit_with_retry(&self.db, self.retry, "clear", |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM places", [])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    pub async fn delete_where<P>(&self, is_expired: P) -> AppResult<usize>
    where
        P: Fn(&PlaceRecord) -> bool + Send + Sync,
    {
        commit_with_retry(&self.db, self.retry, "delete_where", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired: Vec<i64> = load_all_in(&tx)?
                .into_iter()
                .filter(|record| is_expired(record))
                .map(|record| record.id)
                .collect();
            {
                let mut stmt = tx.prepare("DELETE FROM places WHERE id = ?1")?;
                for id in &expired {
                    stmt.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(expired.len())
        })
        .await
    }
}

fn find_by_name_substring_in(conn: &Connection, name: &str) -> AppResult<Option<PlaceRecord>> {
    // SQLite's LIKE and lower() fold ASCII only; names here are mostly Cyrillic.
    let needle = name.to_lowercase();
    Ok(load_all_ascending(conn)?
        .into_iter()
        .find(|record| record.name.to_lowercase().contains(&needle)))
}

fn load_all_ascending(conn: &Connection) -> AppResult<Vec<PlaceRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PLACE_COLUMNS} FROM places ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([], place_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_all_in(tx: &Transaction<'_>) -> AppResult<Vec<PlaceRecord>> {
    load_all_ascending(tx)
}

fn load_in(tx: &Transaction<'_>, id: i64) -> AppResult<PlaceRecord> {
    tx.query_row(
        &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = ?1"),
        [id],
        place_from_row,
    )
    .map_err(Into::into)
}

fn place_from_row(row: &Row<'_>) -> rusqlite::Result<PlaceRecord> {
    let confirmations: Option<i64> = row.get(6)?;
    Ok(PlaceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        lat: row.get(2)?,
        lon: row.get(3)?,
        created_at: row.get(4)?,
        last_seen_at: row.get(5)?,
        confirmations: confirmations.unwrap_or(1).max(1),
        bearing: row.get(7)?,
    })
}
