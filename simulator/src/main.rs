mod snapshot;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use snapshot::Snapshot;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, warn};

/// Publishes retained live snapshots for a set of simulated treatment plants.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "hmi/sensor-data")]
    topic_prefix: String,

    /// Number of devices, named plant-0 .. plant-N.
    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Seconds between two snapshots of the same device.
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,

    /// Probability that a single field is left out of a snapshot.
    #[arg(long, env = "FIELD_DROP_RATE", default_value_t = 0.05)]
    field_drop_rate: f64,

    /// Devices that publish once and then go quiet.
    #[arg(long, env = "SILENT_DEVICES", value_delimiter = ',')]
    silent: Vec<String>,

    /// Clear the retained value of every device and exit.
    #[arg(long)]
    clear: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, devices: {}, interval: {}s, topic prefix: {}",
        args.broker, args.port, args.devices, args.interval_secs, args.topic_prefix
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let prefix = args.topic_prefix.trim_end_matches('/');
    let devices: Vec<String> = (0..args.devices).map(|i| format!("plant-{}", i)).collect();

    if args.clear {
        for device_id in &devices {
            let topic = format!("{}/{}", prefix, device_id);
            // an empty retained payload removes the stored value
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, true, Vec::new()).await {
                warn!("Failed to clear {}: {}", topic, e);
            }
        }
        info!("Cleared {} retained values", devices.len());
        tokio::time::sleep(Duration::from_secs(1)).await;
        return;
    }

    let silent: HashSet<&str> = args.silent.iter().map(String::as_str).collect();
    let drop_rate = args.field_drop_rate.clamp(0.0, 1.0);
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut rng = rand::thread_rng();
    let mut round = 0u64;
    let mut published = 0u64;

    info!("Connected to MQTT broker, publishing snapshots");

    loop {
        interval.tick().await;

        for device_id in &devices {
            if round > 0 && silent.contains(device_id.as_str()) {
                continue;
            }

            let snapshot = Snapshot::generate(&mut rng, drop_rate);
            let payload = match serde_json::to_vec(&snapshot) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize snapshot: {}", e);
                    continue;
                }
            };

            let topic = format!("{}/{}", prefix, device_id);
            match client.publish(&topic, QoS::AtLeastOnce, true, payload).await {
                Ok(_) => published += 1,
                Err(e) => warn!("Failed to publish to {}: {}", topic, e),
            }
        }

        round += 1;
        if round % 30 == 0 {
            info!("Published {} snapshots", published);
        }

        // occasional plant-wide outage
        if rng.gen_bool(0.01) {
            let pause = rng.gen_range(1..4);
            warn!("Pausing all devices for {} rounds", pause);
            for _ in 0..pause {
                interval.tick().await;
            }
        }
    }
}
