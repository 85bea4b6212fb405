use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("imagner_requests_total", "Total number of generation requests").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("imagner_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("imagner_cache_misses_total", "Total cache misses").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "imagner_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("imagner_cache_size", "Current number of items in cache").unwrap();
    pub static ref QUEUE_DEPTH: Gauge =
        register_gauge!("imagner_queue_depth", "Jobs waiting behind the running one").unwrap();
    pub static ref BACKEND_RETRIES: Counter =
        register_counter!("imagner_backend_retries_total", "Backend calls retried after a transient failure").unwrap();
    pub static ref GENERATION_FAILURES: Counter =
        register_counter!("imagner_generation_failures_total", "Jobs that ended in failure").unwrap();
}

// Render every registered metric in the prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
