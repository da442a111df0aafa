//! Live reading reconciliation.
//!
//! An [`Engine`] observes one device at a time. Each observation runs as its
//! own task that owns the device's [`EngineState`], the live subscription,
//! the countdown and staleness timers and any in-flight history query, so
//! stopping the task releases all of them together. Consumers read the
//! result through a `watch` channel of whole [`LiveView`] snapshots.

use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use crate::merge::latest_record;
use crate::metrics::{
    ACTIVE_OBSERVATIONS, FALLBACK_QUERIES_TOTAL, FORCED_REFRESH_TOTAL, LIVE_RESUBSCRIBES_TOTAL,
    LIVE_UPDATES_TOTAL, OFFLINE_TRANSITIONS_TOTAL, QUERY_FAILURES_TOTAL, STALE_CALLBACKS_DISCARDED_TOTAL,
};
use crate::model::{HistoricalRecord, LiveView, SensorReading};
use crate::source::{LiveEvent, LiveSource, QuerySource};
use crate::state::EngineState;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

/// Wall-clock time advanced by the runtime's monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    wall: DateTime<Utc>,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

pub struct Engine {
    live: Arc<dyn LiveSource>,
    query: Arc<dyn QuerySource>,
    config: EngineConfig,
    clock: Clock,
    generation: Arc<AtomicU64>,
    view_tx: watch::Sender<LiveView>,
    active: Option<ActiveObservation>,
}

struct ActiveObservation {
    device_id: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Engine {
    pub fn new(live: Arc<dyn LiveSource>, query: Arc<dyn QuerySource>, config: EngineConfig) -> Self {
        let (view_tx, _) = watch::channel(LiveView::idle(config.refresh_period_secs));
        Self {
            live,
            query,
            config,
            clock: Clock::start(),
            generation: Arc::new(AtomicU64::new(0)),
            view_tx,
            active: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> LiveView {
        self.view_tx.borrow().clone()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.device_id.as_str())
    }

    /// Starts observing `device_id`, tearing down the previous observation
    /// first. Observing the device already observed is a no-op.
    pub async fn observe(&mut self, device_id: &str) {
        if self.device_id() == Some(device_id) {
            return;
        }
        self.stop().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = EngineState::new(device_id, self.clock.now(), self.config.refresh_period_secs);

        let live_rx = match self.live.subscribe(device_id).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(device_id, error = %e, "Live subscription failed, relying on history");
                state.record_live_error(e.to_string());
                None
            }
        };

        self.view_tx.send_replace(state.view());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let observation = Observation {
            device_id: device_id.to_string(),
            generation,
            active_generation: Arc::clone(&self.generation),
            state,
            live: Arc::clone(&self.live),
            live_rx,
            query: Arc::clone(&self.query),
            queries: JoinSet::new(),
            config: self.config.clone(),
            clock: self.clock,
            view_tx: self.view_tx.clone(),
        };
        let task = tokio::spawn(observation.run(shutdown_rx));

        ACTIVE_OBSERVATIONS.inc();
        info!(device_id, generation, "Observing device");

        self.active = Some(ActiveObservation {
            device_id: device_id.to_string(),
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stops the current observation and waits until its task is gone.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        // Invalidate first so nothing the old task still does is published.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = active.shutdown.send(());
        if let Err(e) = active.task.await {
            if e.is_panic() {
                error!(device_id = %active.device_id, "Observation task panicked: {}", e);
            }
        }

        ACTIVE_OBSERVATIONS.dec();
        self.view_tx
            .send_replace(LiveView::idle(self.config.refresh_period_secs));
        info!(device_id = %active.device_id, "Stopped observing device");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            active.task.abort();
            ACTIVE_OBSERVATIONS.dec();
        }
    }
}

struct QueryOutcome {
    generation: u64,
    device_id: String,
    result: Result<Vec<HistoricalRecord>>,
}

struct Observation {
    device_id: String,
    generation: u64,
    active_generation: Arc<AtomicU64>,
    state: EngineState,
    live: Arc<dyn LiveSource>,
    live_rx: Option<mpsc::Receiver<LiveEvent>>,
    query: Arc<dyn QuerySource>,
    queries: JoinSet<QueryOutcome>,
    config: EngineConfig,
    clock: Clock,
    view_tx: watch::Sender<LiveView>,
}

impl Observation {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut countdown = ticker(COUNTDOWN_STEP, MissedTickBehavior::Delay);
        let mut staleness = ticker(
            Duration::from_secs(self.config.staleness_check_secs),
            MissedTickBehavior::Skip,
        );
        let mut resubscribe = ticker(
            Duration::from_secs(self.config.resubscribe_secs),
            MissedTickBehavior::Delay,
        );

        self.request_fallback("observation started");
        self.publish();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                event = next_live(&mut self.live_rx) => match event {
                    Some(event) => self.on_live(event, &mut countdown),
                    None => self.on_live_closed(),
                },

                Some(joined) = self.queries.join_next(), if !self.queries.is_empty() => match joined {
                    Ok(outcome) => self.on_query(outcome),
                    Err(e) => {
                        error!(device_id = %self.device_id, "History query task failed: {}", e);
                        self.state.record_query_error(Error::Query(e.to_string()).to_string());
                    }
                },

                _ = countdown.tick() => self.on_countdown(),

                _ = staleness.tick() => self.on_staleness(),

                _ = resubscribe.tick(), if self.live_rx.is_none() => self.resubscribe().await,
            }

            self.publish();
        }

        debug!(device_id = %self.device_id, "Observation loop stopped");
    }

    fn on_live(&mut self, event: LiveEvent, countdown: &mut Interval) {
        self.state.finish_loading();

        match event {
            LiveEvent::Snapshot(snapshot) => {
                let now = self.clock.now();
                let reading = SensorReading::from_live(&self.device_id, &snapshot, now);
                debug!(
                    device_id = %self.device_id,
                    timestamp = %reading.timestamp,
                    "Live reading received"
                );
                self.state.apply_live(reading, now);
                countdown.reset();
                LIVE_UPDATES_TOTAL.inc();
            }
            LiveEvent::Absent => {
                self.state.clear_live_error();
                info!(device_id = %self.device_id, "No live data for device, loading last known reading");
                self.request_fallback("live feed empty");
            }
            LiveEvent::Failed(e) => {
                warn!(device_id = %self.device_id, error = %e, "Live feed failed, loading last known reading");
                self.state.record_live_error(e.to_string());
                self.request_fallback("live feed failed");
            }
        }
    }

    fn on_live_closed(&mut self) {
        warn!(device_id = %self.device_id, "Live subscription closed by source");
        self.live_rx = None;
        self.state
            .record_live_error(Error::LiveFeed("subscription closed".to_string()).to_string());
        self.request_fallback("live feed closed");
    }

    fn on_query(&mut self, outcome: QueryOutcome) {
        if outcome.generation != self.active_generation.load(Ordering::SeqCst)
            || outcome.device_id != self.device_id
        {
            STALE_CALLBACKS_DISCARDED_TOTAL.inc();
            debug!(
                device_id = %outcome.device_id,
                generation = outcome.generation,
                "Discarding history result of a superseded observation"
            );
            return;
        }

        self.state.finish_loading();

        let batch = match outcome.result {
            Ok(batch) => batch,
            Err(e) => {
                QUERY_FAILURES_TOTAL.inc();
                warn!(device_id = %self.device_id, error = %e, "Failed to load last known reading");
                self.state.record_query_error(e.to_string());
                return;
            }
        };
        self.state.clear_query_error();

        let Some(record) = latest_record(&batch) else {
            info!(device_id = %self.device_id, "No data available for this device");
            self.state.mark_no_data();
            return;
        };

        let reading = SensorReading::from_record(record);
        let timestamp = reading.timestamp;
        if self
            .state
            .apply_fallback(reading, self.config.poll_guard, self.clock.now())
        {
            info!(
                device_id = %self.device_id,
                last_online = %timestamp,
                "Showing last known reading"
            );
        } else {
            debug!(device_id = %self.device_id, "Held reading kept over polled history");
        }
    }

    fn on_countdown(&mut self) {
        if self.state.tick_countdown() {
            FORCED_REFRESH_TOTAL.inc();
            info!(device_id = %self.device_id, "Refresh period elapsed, dropping cached reading");
            self.request_fallback("forced refresh");
        }
    }

    fn on_staleness(&mut self) {
        let threshold = chrono::Duration::seconds(self.config.offline_threshold_secs as i64);
        if self.state.check_staleness(self.clock.now(), threshold) {
            OFFLINE_TRANSITIONS_TOTAL.inc();
            warn!(
                device_id = %self.device_id,
                since = %self.state.last_data_received_at(),
                "Sensor appears to be offline"
            );
        }
    }

    async fn resubscribe(&mut self) {
        match self.live.subscribe(&self.device_id).await {
            Ok(rx) => {
                LIVE_RESUBSCRIBES_TOTAL.inc();
                info!(device_id = %self.device_id, "Live feed re-attached");
                self.live_rx = Some(rx);
            }
            Err(e) => {
                debug!(device_id = %self.device_id, error = %e, "Live feed still unavailable");
                self.state.record_live_error(e.to_string());
            }
        }
    }

    /// At most one history query runs per observation.
    fn request_fallback(&mut self, reason: &'static str) {
        if !self.queries.is_empty() {
            debug!(device_id = %self.device_id, reason, "History query already in flight");
            return;
        }

        FALLBACK_QUERIES_TOTAL.inc();
        debug!(device_id = %self.device_id, reason, "Querying recent history");

        let query = Arc::clone(&self.query);
        let device_id = self.device_id.clone();
        let generation = self.generation;
        let limit = self.config.query_limit;
        self.queries.spawn(async move {
            let result = query.query_recent(&device_id, limit).await;
            QueryOutcome {
                generation,
                device_id,
                result,
            }
        });
    }

    fn publish(&self) {
        if self.active_generation.load(Ordering::SeqCst) != self.generation {
            return;
        }
        self.view_tx.send_replace(self.state.view());
    }
}

async fn next_live(rx: &mut Option<mpsc::Receiver<LiveEvent>>) -> Option<LiveEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn ticker(period: Duration, behavior: MissedTickBehavior) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(behavior);
    interval
}
