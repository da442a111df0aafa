use crate::errors::{Error, Result};
use crate::model::{HistoricalRecord, RawSnapshot};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One notification from a live subscription.
#[derive(Debug)]
pub enum LiveEvent {
    Snapshot(RawSnapshot),
    /// Nothing has been written for the device.
    Absent,
    Failed(Error),
}

/// Push feed of the latest snapshot per device.
#[async_trait]
pub trait LiveSource: Send + Sync {
    /// Dropping the returned receiver releases the subscription.
    async fn subscribe(&self, device_id: &str) -> Result<mpsc::Receiver<LiveEvent>>;
}

/// On-demand fetch of recent history. The batch is not ordered.
#[async_trait]
pub trait QuerySource: Send + Sync {
    async fn query_recent(&self, device_id: &str, limit: usize) -> Result<Vec<HistoricalRecord>>;
}
