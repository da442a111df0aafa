use axum::{routing::get, Router};
use monitor::config::Config;
use monitor::db::{self, PgQuerySource};
use monitor::mqtt::MqttLiveSource;
use monitor::predict::DosingRules;
use monitor::registry::Registry;
use monitor::{archive, metrics, rest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting wastewater live monitor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("Live topic prefix: {}", config.mqtt_topic_prefix);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );
    info!(
        "Offline after {}s, forced refresh every {}s, poll guard {:?}",
        config.engine.offline_threshold_secs,
        config.engine.refresh_period_secs,
        config.engine.poll_guard
    );
    info!(
        "Observations stop after {}s unread, at most {} at once",
        config.observation_idle_secs, config.max_observations
    );

    metrics::init_metrics();

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let (archive_tx, archive_rx) = mpsc::channel(config.channel_capacity);

    let client_id = format!("monitor-{}", uuid::Uuid::new_v4());
    let (live, eventloop) = MqttLiveSource::new(
        config.mqtt_broker.clone(),
        config.mqtt_port,
        client_id,
        config.mqtt_topic_prefix.clone(),
    );
    let mqtt_live = Arc::clone(&live);
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_live.run(eventloop, archive_tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let archive_pool = pool.clone();
    let (batch_size, batch_timeout_ms) = (config.archive_batch_size, config.archive_batch_timeout_ms);
    let archive_handle = tokio::spawn(async move {
        archive::run_archiver(archive_rx, archive_pool, batch_size, batch_timeout_ms).await;
    });

    let registry = Arc::new(Registry::new(
        live.clone(),
        Arc::new(PgQuerySource::new(pool.clone())),
        config.engine.clone(),
        Duration::from_secs(config.observation_idle_secs),
        config.max_observations,
    ));
    let evictor_handle = tokio::spawn(Arc::clone(&registry).run_evictor());

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(
            Arc::clone(&registry),
            pool,
            live,
            Arc::new(DosingRules),
        ));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = archive_handle => {
            error!("Archiver task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    evictor_handle.abort();
    registry.shutdown().await;
    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
