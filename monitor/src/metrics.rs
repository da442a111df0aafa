use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_mqtt_messages_total",
        "Total snapshots received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_mqtt_invalid_messages_total",
        "Total MQTT payloads that could not be decoded"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_channel_full_total",
        "Total events dropped because a subscriber channel was full"
    ))
    .unwrap();
    pub static ref LIVE_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_live_updates_total",
        "Total live readings applied by observations"
    ))
    .unwrap();
    pub static ref FALLBACK_QUERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_fallback_queries_total",
        "Total history queries issued as live-feed fallback"
    ))
    .unwrap();
    pub static ref QUERY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_query_failures_total",
        "Total failed history queries"
    ))
    .unwrap();
    pub static ref OFFLINE_TRANSITIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_offline_transitions_total",
        "Total devices marked offline by the staleness check"
    ))
    .unwrap();
    pub static ref FORCED_REFRESH_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_forced_refresh_total",
        "Total cached readings dropped by the refresh countdown"
    ))
    .unwrap();
    pub static ref STALE_CALLBACKS_DISCARDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_stale_callbacks_discarded_total",
        "Total results ignored because their observation was superseded"
    ))
    .unwrap();
    pub static ref LIVE_RESUBSCRIBES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_live_resubscribes_total",
        "Total live subscriptions re-attached after a failure"
    ))
    .unwrap();
    pub static ref OBSERVATIONS_EVICTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_observations_evicted_total",
        "Total observations stopped for being idle or over capacity"
    ))
    .unwrap();
    pub static ref ACTIVE_OBSERVATIONS: Gauge = Gauge::with_opts(Opts::new(
        "monitor_active_observations",
        "Devices currently being observed"
    ))
    .unwrap();
    pub static ref ARCHIVE_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_archive_rejected_total",
        "Total snapshots kept out of history by validation"
    ))
    .unwrap();
    pub static ref ARCHIVE_COALESCED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_archive_coalesced_total",
        "Total replayed snapshots merged into an already buffered row"
    ))
    .unwrap();
    pub static ref ARCHIVE_DROPPED_ROWS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_archive_dropped_rows_total",
        "Total rows given up on after a failed archive write"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref ARCHIVE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_archive_latency_seconds",
            "Time taken to write an archive batch into the DB"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref ARCHIVE_PENDING_ROWS: Gauge = Gauge::with_opts(Opts::new(
        "monitor_archive_pending_rows",
        "Rows buffered for the next archive write"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LIVE_UPDATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FALLBACK_QUERIES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(QUERY_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OFFLINE_TRANSITIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FORCED_REFRESH_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STALE_CALLBACKS_DISCARDED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LIVE_RESUBSCRIBES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OBSERVATIONS_EVICTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ACTIVE_OBSERVATIONS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_COALESCED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_DROPPED_ROWS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ARCHIVE_PENDING_ROWS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
