//! Prometheus metrics for cache activity
//!
//! Counters are process-wide and shared by every open cache. Call
//! [`init_metrics`] once before [`export_metrics`] so the registry knows
//! about them.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref HITS: IntCounter = IntCounter::new(
        "gencache_hits_total",
        "Lookups that found their object"
    ).unwrap();

    pub static ref MISSES: IntCounter = IntCounter::new(
        "gencache_misses_total",
        "Lookups for objects not in the cache"
    ).unwrap();

    pub static ref ADDS: IntCounter = IntCounter::new(
        "gencache_adds_total",
        "Objects stored"
    ).unwrap();

    pub static ref ADD_REJECTED: IntCounter = IntCounter::new(
        "gencache_add_rejected_total",
        "Adds skipped because the object was present or the cache was full"
    ).unwrap();

    pub static ref EVICTIONS: IntCounter = IntCounter::new(
        "gencache_evictions_total",
        "Objects evicted by trim"
    ).unwrap();

    pub static ref TRIM_REFUSED: IntCounter = IntCounter::new(
        "gencache_trim_refused_total",
        "Trims refused because views were open"
    ).unwrap();

    pub static ref BYTES: IntGauge = IntGauge::new(
        "gencache_bytes",
        "Payload bytes stored in the most recently updated cache"
    ).unwrap();

    pub static ref ITEMS: IntGauge = IntGauge::new(
        "gencache_items",
        "Objects stored in the most recently updated cache"
    ).unwrap();
}

/// Register all cache metrics; safe to call more than once
pub fn init_metrics() {
    METRICS_REGISTRY.register(Box::new(HITS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(MISSES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ADDS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ADD_REJECTED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(EVICTIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(TRIM_REFUSED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BYTES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ITEMS.clone())).ok();

    info!("Metrics initialized");
}

/// Render the registry in the Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
