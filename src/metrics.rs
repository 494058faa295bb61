// Prometheus metrics for tiergate admission control
//
// Exposes metrics on /metrics HTTP endpoint:
// - Admission decisions by outcome (counter)
// - Tier lookups and tier cache hits (counter)
// - Queue depth per tier (gauge)
// - Queue entry lifecycle and wait time (counter, histogram)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref ADMISSION_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("admission_decisions_total", "Rate limit decisions by outcome"),
        &["outcome"]
    ).expect("Failed to create admission decisions metric");

    pub static ref TIER_LIMIT_UPDATES_TOTAL: IntCounter = IntCounter::new(
        "tier_limit_updates_total",
        "Number of applied tier limit changes"
    ).expect("Failed to create tier limit updates metric");

    // Tier resolution metrics
    pub static ref TIER_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tier_lookups_total", "Tier lookup service calls by result"),
        &["result"]
    ).expect("Failed to create tier lookups metric");

    pub static ref TIER_CACHE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tier_cache_total", "Tier cache hits and misses"),
        &["result"]
    ).expect("Failed to create tier cache metric");

    // Queue metrics
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("queue_depth", "Entries waiting per tier queue"),
        &["tier"]
    ).expect("Failed to create queue depth metric");

    pub static ref QUEUE_ENTRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queue_entries_total", "Queue entry transitions by tier and outcome"),
        &["tier", "outcome"]
    ).expect("Failed to create queue entries metric");

    pub static ref QUEUE_WAIT_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("queue_wait_seconds", "Time from enqueue to dequeue in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["tier"]
    ).expect("Failed to create queue wait metric");
}

/// Register every metric with [`REGISTRY`].
///
/// Safe to call more than once; already-registered collectors are skipped.
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ADMISSION_DECISIONS_TOTAL.clone()),
        Box::new(TIER_LIMIT_UPDATES_TOTAL.clone()),
        Box::new(TIER_LOOKUPS_TOTAL.clone()),
        Box::new(TIER_CACHE_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(QUEUE_ENTRIES_TOTAL.clone()),
        Box::new(QUEUE_WAIT_SECONDS.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_contains_admission_metrics() {
        init().unwrap();
        ADMISSION_DECISIONS_TOTAL.with_label_values(&["allowed"]).inc();
        QUEUE_DEPTH.with_label_values(&["free"]).set(3);

        let text = gather_metrics().unwrap();
        assert!(text.contains("admission_decisions_total"));
        assert!(text.contains("queue_depth"));
    }
}
