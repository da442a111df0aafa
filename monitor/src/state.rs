use crate::config::PollGuard;
use crate::merge::should_replace;
use crate::model::{LiveView, SensorReading};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline { since: DateTime<Utc> },
}

/// Reconciled state of one observed device.
///
/// Every transition takes the current instant explicitly; the owning
/// observation task supplies it from its clock.
#[derive(Debug, Clone)]
pub struct EngineState {
    device_id: String,
    current: Option<SensorReading>,
    last_updated: DateTime<Utc>,
    last_data_received_at: DateTime<Utc>,
    connectivity: Connectivity,
    seconds_until_refresh: u32,
    refresh_period: u32,
    loading: bool,
    live_error: Option<String>,
    query_error: Option<String>,
    no_data: bool,
}

impl EngineState {
    pub fn new(device_id: impl Into<String>, now: DateTime<Utc>, refresh_period: u32) -> Self {
        Self {
            device_id: device_id.into(),
            current: None,
            last_updated: now,
            last_data_received_at: now,
            connectivity: Connectivity::Online,
            seconds_until_refresh: refresh_period,
            refresh_period,
            loading: true,
            live_error: None,
            query_error: None,
            no_data: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn current(&self) -> Option<&SensorReading> {
        self.current.as_ref()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn seconds_until_refresh(&self) -> u32 {
        self.seconds_until_refresh
    }

    pub fn last_data_received_at(&self) -> DateTime<Utc> {
        self.last_data_received_at
    }

    /// A live push always wins, whatever its own timestamp says.
    pub fn apply_live(&mut self, reading: SensorReading, now: DateTime<Utc>) {
        self.current = Some(reading);
        self.last_updated = now;
        self.last_data_received_at = now;
        self.connectivity = Connectivity::Online;
        self.seconds_until_refresh = self.refresh_period;
        self.live_error = None;
        self.no_data = false;
    }

    /// Offers a reading rebuilt from history. Returns whether it was taken.
    pub fn apply_fallback(
        &mut self,
        reading: SensorReading,
        guard: PollGuard,
        now: DateTime<Utc>,
    ) -> bool {
        if !should_replace(self.current.as_ref(), &reading, guard) {
            return false;
        }

        self.connectivity = Connectivity::Offline {
            since: reading.timestamp,
        };
        self.current = Some(reading);
        self.last_updated = now;
        self.no_data = false;
        true
    }

    /// Latches offline once live data is older than `threshold`. Only a live
    /// push brings the device back online.
    pub fn check_staleness(&mut self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.connectivity != Connectivity::Online {
            return false;
        }
        if now.signed_duration_since(self.last_data_received_at) <= threshold {
            return false;
        }

        self.connectivity = Connectivity::Offline {
            since: self.last_data_received_at,
        };
        true
    }

    /// One second of countdown. Returns true when the cached reading was
    /// dropped and has to be fetched again.
    pub fn tick_countdown(&mut self) -> bool {
        self.seconds_until_refresh = self.seconds_until_refresh.saturating_sub(1);
        if self.seconds_until_refresh > 0 {
            return false;
        }

        self.seconds_until_refresh = self.refresh_period;
        self.current = None;
        true
    }

    pub fn record_live_error(&mut self, message: impl Into<String>) {
        self.live_error = Some(message.into());
    }

    pub fn record_query_error(&mut self, message: impl Into<String>) {
        self.query_error = Some(message.into());
    }

    /// The live channel answered, even if only to say it holds nothing.
    pub fn clear_live_error(&mut self) {
        self.live_error = None;
    }

    pub fn clear_query_error(&mut self) {
        self.query_error = None;
    }

    pub fn mark_no_data(&mut self) {
        if self.current.is_none() {
            self.no_data = true;
        }
    }

    pub fn finish_loading(&mut self) {
        self.loading = false;
    }

    /// Only reported once neither channel can deliver.
    pub fn error(&self) -> Option<String> {
        match (&self.live_error, &self.query_error) {
            (Some(live), Some(query)) => Some(format!("{}; {}", live, query)),
            _ => None,
        }
    }

    pub fn view(&self) -> LiveView {
        let (is_offline, offline_since) = match self.connectivity {
            Connectivity::Online => (false, None),
            Connectivity::Offline { since } => (true, Some(since)),
        };

        LiveView {
            device_id: Some(self.device_id.clone()),
            current_reading: self.current.clone(),
            last_updated: Some(self.last_updated),
            last_data_received_at: Some(self.last_data_received_at),
            seconds_until_refresh: self.seconds_until_refresh,
            is_offline,
            offline_since,
            loading: self.loading,
            error: self.error(),
            no_data: self.no_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HistoricalRecord, RawSnapshot};
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    const REFRESH: u32 = 360;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn live_at(secs: i64) -> SensorReading {
        let snapshot: RawSnapshot =
            serde_json::from_value(json!({ "PH": 7.1, "Timestamp": t(secs).to_rfc3339() })).unwrap();
        SensorReading::from_live("dev-1", &snapshot, t(secs))
    }

    fn history_at(secs: i64) -> SensorReading {
        SensorReading::from_record(&HistoricalRecord {
            id: Uuid::new_v4(),
            device_id: "dev-1".to_string(),
            timestamp: t(secs),
            ph: Some(6.8),
            bod: None,
            cod: None,
            tss: None,
            flow: None,
            temperature: None,
            dissolved_oxygen: None,
            conductivity: None,
            turbidity: None,
        })
    }

    fn assert_offline_pairing(state: &EngineState) {
        let view = state.view();
        assert_eq!(view.is_offline, view.offline_since.is_some());
    }

    #[test]
    fn test_live_push_resets_countdown_and_goes_online() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        for _ in 0..100 {
            state.tick_countdown();
        }
        assert!(state.apply_fallback(history_at(-50), PollGuard::Presence, t(100)));
        assert!(state.view().is_offline);

        state.apply_live(live_at(101), t(101));

        let view = state.view();
        assert_eq!(view.seconds_until_refresh, REFRESH);
        assert!(!view.is_offline);
        assert_eq!(view.offline_since, None);
        assert!(!view.current_reading.unwrap().is_offline);
        assert_eq!(state.last_data_received_at(), t(101));
    }

    #[test]
    fn test_held_live_reading_survives_newer_poll() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        state.apply_live(live_at(10), t(10));

        assert!(!state.apply_fallback(history_at(20), PollGuard::Presence, t(21)));

        let current = state.current().unwrap();
        assert_eq!(current.timestamp, t(10));
        assert!(!current.is_offline);
        assert_eq!(state.connectivity(), Connectivity::Online);
    }

    #[test]
    fn test_fallback_does_not_advance_last_received() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        assert!(state.apply_fallback(history_at(-600), PollGuard::Presence, t(5)));

        assert_eq!(state.last_data_received_at(), t(0));
        assert_eq!(
            state.connectivity(),
            Connectivity::Offline { since: t(-600) }
        );
        assert_eq!(state.view().last_updated, Some(t(5)));
    }

    #[test]
    fn test_recency_guard_upgrades_older_history() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        assert!(state.apply_fallback(history_at(-600), PollGuard::Recency, t(1)));
        assert!(state.apply_fallback(history_at(-300), PollGuard::Recency, t(2)));
        assert!(!state.apply_fallback(history_at(-900), PollGuard::Recency, t(3)));

        assert_eq!(state.current().unwrap().timestamp, t(-300));
        assert_eq!(state.connectivity(), Connectivity::Offline { since: t(-300) });
    }

    #[test]
    fn test_staleness_latches_at_last_live_receipt() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        state.apply_live(live_at(0), t(0));
        let threshold = Duration::seconds(300);

        assert!(!state.check_staleness(t(300), threshold));
        assert!(!state.view().is_offline);

        assert!(state.check_staleness(t(301), threshold));
        let view = state.view();
        assert!(view.is_offline);
        assert_eq!(view.offline_since, Some(t(0)));

        // latched: a later tick does not move offline_since
        assert!(!state.check_staleness(t(900), threshold));
        assert_eq!(state.view().offline_since, Some(t(0)));
        assert_offline_pairing(&state);

        state.apply_live(live_at(901), t(901));
        assert!(!state.view().is_offline);
        assert_offline_pairing(&state);
    }

    #[test]
    fn test_countdown_forces_refresh_at_zero() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        state.apply_live(live_at(0), t(0));

        for _ in 0..(REFRESH - 1) {
            assert!(!state.tick_countdown());
        }
        assert_eq!(state.seconds_until_refresh(), 1);
        assert!(state.current().is_some());

        assert!(state.tick_countdown());
        assert!(state.current().is_none());
        assert_eq!(state.seconds_until_refresh(), REFRESH);
    }

    #[test]
    fn test_error_needs_both_channels_down() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        assert!(state.apply_fallback(history_at(-60), PollGuard::Presence, t(1)));

        state.record_live_error("Live feed error: connection refused");
        assert_eq!(state.view().error, None);

        state.record_query_error("History query error: timeout");
        let view = state.view();
        assert!(view.error.is_some());
        assert!(view.current_reading.is_some());

        state.clear_query_error();
        assert_eq!(state.view().error, None);
    }

    #[test]
    fn test_absent_answer_clears_live_error() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        state.record_live_error("Live feed error: connection lost");
        state.clear_live_error();

        state.record_query_error("History query error: connection reset");
        assert_eq!(state.view().error, None);
    }

    #[test]
    fn test_no_data_only_when_nothing_held() {
        let mut state = EngineState::new("dev-1", t(0), REFRESH);
        state.mark_no_data();
        assert!(state.view().no_data);

        state.apply_live(live_at(1), t(1));
        assert!(!state.view().no_data);
        state.mark_no_data();
        assert!(!state.view().no_data);
    }
}
