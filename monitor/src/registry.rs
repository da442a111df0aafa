use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::metrics::OBSERVATIONS_EVICTED_TOTAL;
use crate::model::LiveView;
use crate::source::{LiveSource, QuerySource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

struct Entry {
    engine: Engine,
    last_read: Instant,
}

/// One engine per device the HTTP surface has been asked about. Engines
/// nobody reads for `idle_after` are stopped, and at most `capacity` run at
/// once.
pub struct Registry {
    live: Arc<dyn LiveSource>,
    query: Arc<dyn QuerySource>,
    config: EngineConfig,
    idle_after: Duration,
    capacity: usize,
    engines: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new(
        live: Arc<dyn LiveSource>,
        query: Arc<dyn QuerySource>,
        config: EngineConfig,
        idle_after: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            live,
            query,
            config,
            idle_after,
            capacity: capacity.max(1),
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Current view of `device_id`, starting to observe it on first use.
    pub async fn view(&self, device_id: &str) -> LiveView {
        let mut evicted = Vec::new();
        let view = {
            let mut engines = self.engines.lock().await;
            if let Some(entry) = engines.get_mut(device_id) {
                entry.last_read = Instant::now();
                return entry.engine.view();
            }

            if engines.len() >= self.capacity {
                let oldest = engines
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_read)
                    .map(|(id, _)| id.clone());
                if let Some(id) = oldest {
                    info!(device_id = %id, "Observation limit reached, evicting least recently read device");
                    evicted.extend(engines.remove(&id).map(|entry| entry.engine));
                }
            }

            let mut engine = Engine::new(
                Arc::clone(&self.live),
                Arc::clone(&self.query),
                self.config.clone(),
            );
            engine.observe(device_id).await;
            let view = engine.view();
            engines.insert(
                device_id.to_string(),
                Entry {
                    engine,
                    last_read: Instant::now(),
                },
            );
            view
        };

        stop_all(evicted).await;
        view
    }

    /// View of a device that is already observed. Does not start observing.
    pub async fn peek(&self, device_id: &str) -> Option<LiveView> {
        let mut engines = self.engines.lock().await;
        engines.get_mut(device_id).map(|entry| {
            entry.last_read = Instant::now();
            entry.engine.view()
        })
    }

    /// Stops observing `device_id`. Returns false if it was not observed.
    pub async fn release(&self, device_id: &str) -> bool {
        let entry = self.engines.lock().await.remove(device_id);
        match entry {
            Some(mut entry) => {
                entry.engine.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn observed(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.engines.lock().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Stops every engine not read within the idle period. Returns how many
    /// were stopped.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<Engine> = {
            let mut engines = self.engines.lock().await;
            let expired: Vec<String> = engines
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_read) >= self.idle_after)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| engines.remove(id))
                .map(|entry| entry.engine)
                .collect()
        };

        let count = idle.len();
        if count > 0 {
            info!("Stopping {} idle observations", count);
        }
        stop_all(idle).await;
        count
    }

    /// Periodic idle eviction, for the lifetime of the process.
    pub async fn run_evictor(self: Arc<Self>) {
        let period = (self.idle_after / 4).max(Duration::from_secs(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = self.evict_idle().await;
            debug!(evicted, "Idle observation sweep");
        }
    }

    pub async fn shutdown(&self) {
        let engines: Vec<Engine> = self
            .engines
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry.engine)
            .collect();
        info!("Stopping {} observations", engines.len());
        for mut engine in engines {
            engine.stop().await;
        }
    }
}

async fn stop_all(engines: Vec<Engine>) {
    for mut engine in engines {
        engine.stop().await;
        OBSERVATIONS_EVICTED_TOTAL.inc();
    }
}
