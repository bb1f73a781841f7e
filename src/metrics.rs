//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation metrics
    pub static ref ACTIVITIES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("almanac_activities_received_total", "Inbound activities by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("almanac_deliveries_total", "Outbound delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref RELATIONSHIP_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("almanac_relationship_transitions_total", "Follow relationship transitions by resulting state"),
        &["state"]
    ).expect("metric can be created");

    // Cache metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("almanac_cache_hits_total", "Cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("almanac_cache_misses_total", "Cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("almanac_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("almanac_errors_total", "Errors surfaced over HTTP by kind"),
        &["kind"]
    ).expect("metric can be created");
}

/// Register all instruments with the global registry
///
/// Safe to call more than once; re-registration is ignored so tests can
/// initialize freely.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(ACTIVITIES_RECEIVED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RELATIONSHIP_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_SIZE.clone()));
    let _ = REGISTRY.register(Box::new(ERRORS_TOTAL.clone()));
}

/// Render the registry in Prometheus text exposition format
pub fn render() -> String {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(%error, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
