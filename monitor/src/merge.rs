use crate::config::PollGuard;
use crate::model::{HistoricalRecord, SensorReading};

/// Most recent record of an unordered batch. Equal timestamps keep the
/// earlier record.
pub fn latest_record(records: &[HistoricalRecord]) -> Option<&HistoricalRecord> {
    records.iter().reduce(|best, candidate| {
        if candidate.timestamp > best.timestamp {
            candidate
        } else {
            best
        }
    })
}

/// Whether a reading rebuilt from history may take the place of `current`.
pub fn should_replace(
    current: Option<&SensorReading>,
    candidate: &SensorReading,
    guard: PollGuard,
) -> bool {
    match (current, guard) {
        (None, _) => true,
        (Some(_), PollGuard::Presence) => false,
        (Some(held), PollGuard::Recency) => held.is_offline && candidate.timestamp > held.timestamp,
    }
}
