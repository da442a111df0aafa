use crate::errors::{Error, Result};
use crate::metrics::{
    ARCHIVE_REJECTED_TOTAL, CHANNEL_FULL_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL,
};
use crate::model::{HistoricalRecord, RawSnapshot};
use crate::source::{LiveEvent, LiveSource};
use crate::validate::validate;
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Default)]
struct Shared {
    latest: HashMap<String, RawSnapshot>,
    subscribers: HashMap<String, Vec<mpsc::Sender<LiveEvent>>>,
    connected: bool,
}

/// Live feed over MQTT. Devices publish retained JSON snapshots on
/// `{prefix}/{device_id}`; an empty retained payload clears the value.
pub struct MqttLiveSource {
    client: AsyncClient,
    topic_prefix: String,
    shared: Mutex<Shared>,
}

impl MqttLiveSource {
    pub fn new(
        broker: String,
        port: u16,
        client_id: String,
        topic_prefix: String,
    ) -> (Arc<Self>, EventLoop) {
        let mut mqtt_options = MqttOptions::new(client_id, broker, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        // Fresh session each connect so the broker replays retained values.
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let source = Self {
            client,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            shared: Mutex::new(Shared::default()),
        };

        (Arc::new(source), eventloop)
    }

    /// Last snapshot seen for `device_id`.
    pub fn latest(&self, device_id: &str) -> Option<RawSnapshot> {
        self.shared().latest.get(device_id).cloned()
    }

    pub async fn run(
        self: Arc<Self>,
        mut eventloop: EventLoop,
        archive_tx: mpsc::Sender<HistoricalRecord>,
    ) -> Result<()> {
        let topic = format!("{}/#", self.topic_prefix);
        info!("Starting live feed on {}", topic);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.client
                        .try_subscribe(topic.as_str(), QoS::AtLeastOnce)
                        .map_err(Error::Mqtt)?;
                    self.set_connected(true);
                    info!("Connected to MQTT broker, subscribed to {} with QoS 1", topic);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    MESSAGES_TOTAL.inc();
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );
                    self.handle_publish(&publish.topic, &publish.payload, &archive_tx);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {}", e);
                    self.connection_lost(&e.to_string());
                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn handle_publish(
        &self,
        topic: &str,
        payload: &[u8],
        archive_tx: &mpsc::Sender<HistoricalRecord>,
    ) {
        let Some(device_id) = self.device_id_from_topic(topic) else {
            debug!("Ignoring message on topic {}", topic);
            return;
        };

        if payload.is_empty() {
            info!(device_id, "Live value cleared");
            let mut shared = self.shared();
            shared.latest.remove(device_id);
            dispatch(&mut shared, device_id, || LiveEvent::Absent);
            return;
        }

        let snapshot = match RawSnapshot::from_slice(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                INVALID_MESSAGES_TOTAL.inc();
                warn!(device_id, "Undecodable snapshot: {}", e);
                return;
            }
        };

        let record = HistoricalRecord::from_snapshot(device_id, &snapshot, Utc::now());
        {
            let mut shared = self.shared();
            shared.latest.insert(device_id.to_string(), snapshot.clone());
            dispatch(&mut shared, device_id, || LiveEvent::Snapshot(snapshot.clone()));
        }

        if let Err(e) = validate(&record) {
            ARCHIVE_REJECTED_TOTAL.inc();
            debug!(device_id, "Not archiving snapshot: {}", e);
            return;
        }

        match archive_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                CHANNEL_FULL_TOTAL.inc();
                warn!(device_id, "Archive channel full, dropping snapshot from history");
            }
            Err(TrySendError::Closed(_)) => {
                error!("Archive channel closed, cannot archive snapshot");
            }
        }
    }

    fn connection_lost(&self, reason: &str) {
        let mut shared = self.shared();
        if !shared.connected {
            return;
        }
        shared.connected = false;

        let device_ids: Vec<String> = shared.subscribers.keys().cloned().collect();
        for device_id in device_ids {
            dispatch(&mut shared, &device_id, || {
                LiveEvent::Failed(Error::LiveFeed(reason.to_string()))
            });
        }
    }

    fn set_connected(&self, connected: bool) {
        self.shared().connected = connected;
    }

    fn device_id_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let device_id = topic
            .strip_prefix(self.topic_prefix.as_str())?
            .strip_prefix('/')?;
        (!device_id.is_empty() && !device_id.contains('/')).then_some(device_id)
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LiveSource for MqttLiveSource {
    async fn subscribe(&self, device_id: &str) -> Result<mpsc::Receiver<LiveEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut shared = self.shared();

        // Like a value listener, report the current value straight away.
        let initial = match shared.latest.get(device_id) {
            Some(snapshot) => LiveEvent::Snapshot(snapshot.clone()),
            None if shared.connected => LiveEvent::Absent,
            None => LiveEvent::Failed(Error::LiveFeed("MQTT broker not connected".to_string())),
        };
        tx.try_send(initial).map_err(|_| Error::ChannelSend)?;

        shared
            .subscribers
            .entry(device_id.to_string())
            .or_default()
            .push(tx);
        debug!(device_id, "Live subscriber registered");

        Ok(rx)
    }
}

/// Fans an event out to the device's subscribers, pruning released ones.
fn dispatch(shared: &mut Shared, device_id: &str, event: impl Fn() -> LiveEvent) {
    let Some(subscribers) = shared.subscribers.get_mut(device_id) else {
        return;
    };

    subscribers.retain(|tx| !tx.is_closed());
    for tx in subscribers.iter() {
        match tx.try_send(event()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!(device_id, "Subscriber channel full, dropping live event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    if subscribers.is_empty() {
        shared.subscribers.remove(device_id);
    }
}
