//! Prometheus metrics for the broker

use parking_lot::Mutex;
use prometheus::{
    register_counter, register_counter_vec, Counter, CounterVec, Encoder, TextEncoder,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serializes registration so concurrent first calls cannot double-register.
static INIT_LOCK: Mutex<()> = Mutex::new(());

pub struct Metrics {
    /// CloudEvents accepted at the ingest endpoint
    pub ingest_received: Counter,

    /// Requests rejected because they did not carry a valid CloudEvent
    pub ingest_malformed: Counter,

    /// Events the backend refused to take (mapped to NACK responses)
    pub ingest_nacked: Counter,

    /// Events that could not be delivered anywhere, by trigger
    pub events_lost: CounterVec,
}

impl Metrics {
    /// Initialize and register all metrics. Returns the existing instance if
    /// already initialized.
    pub fn init() -> prometheus::Result<&'static Metrics> {
        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            ingest_received: register_counter!(
                "virta_ingest_received_total",
                "CloudEvents accepted at the ingest endpoint"
            )?,
            ingest_malformed: register_counter!(
                "virta_ingest_malformed_total",
                "Requests rejected for not carrying a valid CloudEvent"
            )?,
            ingest_nacked: register_counter!(
                "virta_ingest_nacked_total",
                "Events the backend refused to take"
            )?,
            events_lost: register_counter_vec!(
                "virta_events_lost_total",
                "Events that could not be delivered to their target nor dead-letter sink",
                &["trigger"]
            )?,
        };

        Ok(METRICS.get_or_init(|| metrics))
    }

    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
