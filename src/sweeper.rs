use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosticSink;
use crate::errors::AppResult;
use crate::store::{PlaceRecord, PlaceStore};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Clone)]
pub struct TtlSweeper {
    store: PlaceStore,
    ttl: ChronoDuration,
    interval: Duration,
    diagnostics: DiagnosticSink,
}

impl TtlSweeper {
    pub fn new(
        store: PlaceStore,
        ttl: ChronoDuration,
        interval: Duration,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            store,
            ttl,
            interval,
            diagnostics,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let ttl = self.ttl;
        let deleted = self
            .store
            .delete_where(move |record| is_expired(record, now, ttl))
            .await?;
        if deleted > 0 {
            info!(deleted, "swept expired places");
        } else {
            debug!("no expired places");
        }
        Ok(deleted)
    }

    // First tick fires immediately.
    pub fn spawn(self) -> SweeperHandle {
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_once(Utc::now()).await {
                    Ok(deleted) => self
                        .diagnostics
                        .emit("sweep_completed", json!({ "deleted": deleted })),
                    Err(err) => {
                        warn!(?err, "sweep pass failed");
                        self.diagnostics
                            .emit("sweep_failed", json!({ "reason": err.to_string() }));
                    }
                }
            }
        });
        SweeperHandle { task }
    }
}

pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn shutdown(self) {
        self.task.abort();
        info!("sweeper stopped");
    }
}

fn is_expired(record: &PlaceRecord, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
    let Some(raw) = record.reference_timestamp() else {
        return false;
    };
    match parse_timestamp(raw) {
        Some(reference) => now - reference > ttl,
        None => {
            warn!(id = record.id, timestamp = raw, "unreadable timestamp; keeping place");
            false
        }
    }
}

// Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|value| value.and_utc())
}
