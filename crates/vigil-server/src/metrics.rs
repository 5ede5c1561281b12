//! Process Metrics
//!
//! Prometheus counters and gauges for the streaming pipeline and the alert
//! plane, exposed as text on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Gauge, Histogram, TextEncoder};

pub static FRAMES_PROCESSED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("vigil_frames_processed_total", "Decoded frames run through the pipeline").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static FRAMES_DROPPED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("vigil_frames_dropped_total", "Frames dropped by backpressure").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ANOMALIES_DETECTED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("vigil_anomalies_detected_total", "Positive anomaly classifications").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_DELIVERED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("vigil_alerts_delivered_total", "Anomaly alerts pushed to user channels").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_DROPPED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "vigil_alerts_dropped_total",
        "Anomaly alerts dropped because the user had no channel",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static RECORDER_FAILURES: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("vigil_recorder_failures_total", "Failed anomaly persistence attempts").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static WS_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("vigil_ws_connections", "Open alert channels").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static ACTIVE_STREAMS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("vigil_active_streams", "Registered peer connections").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static OFFER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "vigil_offer_duration_seconds",
        "Histogram of signaling offer handling latency",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

/// Force registration of every metric at startup
pub fn register_all() {
    let _ = &*FRAMES_PROCESSED;
    let _ = &*FRAMES_DROPPED;
    let _ = &*ANOMALIES_DETECTED;
    let _ = &*ALERTS_DELIVERED;
    let _ = &*ALERTS_DROPPED;
    let _ = &*RECORDER_FAILURES;
    let _ = &*WS_CONNECTIONS;
    let _ = &*ACTIVE_STREAMS;
    let _ = &*OFFER_LATENCY;
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
