//! Archives live snapshots into `sensor_readings`, where they later serve as
//! the history fallback for devices that went quiet.

use crate::db::{insert_batch, is_transient_error};
use crate::errors::Error;
use crate::metrics::{
    ARCHIVE_COALESCED_TOTAL, ARCHIVE_DROPPED_ROWS_TOTAL, ARCHIVE_LATENCY_SECONDS,
    ARCHIVE_PENDING_ROWS, DB_FAILURES_TOTAL,
};
use crate::model::HistoricalRecord;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MAX_ATTEMPTS: u32 = 4;

/// Rows waiting for the next write, one per device and capture time.
#[derive(Debug, Default)]
pub struct PendingRows {
    rows: HashMap<(String, DateTime<Utc>), HistoricalRecord>,
}

impl PendingRows {
    /// Retained values are replayed on every reconnect, so a repeat of a
    /// buffered row replaces it. Returns false for such a repeat.
    pub fn push(&mut self, record: HistoricalRecord) -> bool {
        let key = (record.device_id.clone(), record.timestamp);
        self.rows.insert(key, record).is_none()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn take(&mut self) -> Vec<HistoricalRecord> {
        self.rows.drain().map(|(_, record)| record).collect()
    }

    /// Puts back a batch whose write was deferred. Rows buffered since
    /// then win over the returned ones.
    pub fn restore(&mut self, batch: Vec<HistoricalRecord>) {
        for record in batch {
            self.rows
                .entry((record.device_id.clone(), record.timestamp))
                .or_insert(record);
        }
    }
}

/// What to do with a batch whose write just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry(Duration),
    /// Keep the rows for the next flush.
    Defer,
    Drop,
}

/// `attempt` counts from 1. Only connection-level database errors are
/// retried; anything else will fail the same way again.
pub fn failure_action(attempt: u32, error: &Error) -> FailureAction {
    let transient = matches!(error, Error::Database(e) if is_transient_error(e));
    if !transient {
        FailureAction::Drop
    } else if attempt < MAX_ATTEMPTS {
        FailureAction::Retry(Duration::from_millis(100 * 2_u64.pow(attempt.saturating_sub(1))))
    } else {
        FailureAction::Defer
    }
}

pub async fn run_archiver(
    mut rx: mpsc::Receiver<HistoricalRecord>,
    pool: PgPool,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(max_batch, max_wait_ms, "Starting archiver");

    // deferred rows are kept up to this bound while the database is down
    let max_pending = max_batch.saturating_mul(4);
    let mut pending = PendingRows::default();
    let mut flush_timer = interval(Duration::from_millis(max_wait_ms));
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    if !pending.push(record) {
                        ARCHIVE_COALESCED_TOTAL.inc();
                    }
                    ARCHIVE_PENDING_ROWS.set(pending.len() as f64);
                    if pending.len() >= max_batch {
                        flush(&pool, &mut pending, max_pending).await;
                    }
                }
                None => {
                    info!("Archive channel closed, writing remaining rows");
                    flush(&pool, &mut pending, 0).await;
                    break;
                }
            },

            _ = flush_timer.tick() => flush(&pool, &mut pending, max_pending).await,
        }
    }

    info!("Archiver stopped");
}

async fn flush(pool: &PgPool, pending: &mut PendingRows, max_pending: usize) {
    if pending.is_empty() {
        return;
    }

    let batch = pending.take();
    let start = Instant::now();
    let mut attempt = 1;

    loop {
        let error = match insert_batch(pool, &batch).await {
            Ok(inserted) => {
                ARCHIVE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                debug!(
                    rows = batch.len(),
                    inserted,
                    attempt,
                    "Archived snapshots"
                );
                break;
            }
            Err(e) => e,
        };

        DB_FAILURES_TOTAL.inc();
        match failure_action(attempt, &error) {
            FailureAction::Retry(delay) => {
                warn!(
                    "Archive write failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt, MAX_ATTEMPTS, delay, error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            FailureAction::Defer if pending.len() + batch.len() <= max_pending => {
                warn!(
                    "Database unavailable, keeping {} rows for the next flush: {}",
                    batch.len(),
                    error
                );
                pending.restore(batch);
                break;
            }
            FailureAction::Defer | FailureAction::Drop => {
                ARCHIVE_DROPPED_ROWS_TOTAL.inc_by(batch.len() as f64);
                error!(
                    "Failed to archive {} rows, they will be missing from history: {}",
                    batch.len(),
                    error
                );
                break;
            }
        }
    }

    ARCHIVE_PENDING_ROWS.set(pending.len() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn row(device_id: &str, secs: i64, ph: f64) -> HistoricalRecord {
        HistoricalRecord {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(secs),
            ph: Some(ph),
            bod: None,
            cod: None,
            tss: None,
            flow: None,
            temperature: None,
            dissolved_oxygen: None,
            conductivity: None,
            turbidity: None,
        }
    }

    #[test]
    fn test_replayed_snapshot_is_coalesced() {
        let mut pending = PendingRows::default();
        assert!(pending.push(row("plant-1", 0, 7.0)));
        assert!(pending.push(row("plant-2", 0, 7.1)));
        assert!(!pending.push(row("plant-1", 0, 7.2)));
        assert!(pending.push(row("plant-1", 10, 7.3)));
        assert_eq!(pending.len(), 3);

        let mut batch = pending.take();
        batch.sort_by(|a, b| (&a.device_id, a.timestamp).cmp(&(&b.device_id, b.timestamp)));
        assert_eq!(batch[0].ph, Some(7.2));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_restore_keeps_newer_rows() {
        let mut pending = PendingRows::default();
        pending.push(row("plant-1", 0, 7.0));
        let deferred = pending.take();

        pending.push(row("plant-1", 0, 7.5));
        pending.push(row("plant-1", 5, 7.6));
        pending.restore(deferred);

        assert_eq!(pending.len(), 2);
        let batch = pending.take();
        let first = batch.iter().find(|r| r.timestamp == row("plant-1", 0, 0.0).timestamp);
        assert_eq!(first.unwrap().ph, Some(7.5));
    }

    #[test]
    fn test_transient_failures_retry_then_defer() {
        let error = Error::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(
            failure_action(1, &error),
            FailureAction::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            failure_action(3, &error),
            FailureAction::Retry(Duration::from_millis(400))
        );
        assert_eq!(failure_action(MAX_ATTEMPTS, &error), FailureAction::Defer);
    }

    #[test]
    fn test_permanent_failures_are_not_retried() {
        let error = Error::Database(sqlx::Error::RowNotFound);
        assert_eq!(failure_action(1, &error), FailureAction::Drop);
        assert_eq!(
            failure_action(1, &Error::Validation("bad row".to_string())),
            FailureAction::Drop
        );
    }
}
