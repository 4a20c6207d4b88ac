// context-keeper/crates/context-keeper/src/metrics.rs

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Registry, TextEncoder};
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref METRICS: Option<ContextMetrics> = match ContextMetrics::register(&REGISTRY) {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!("Failed to register context metrics: {}", e);
            None
        }
    };
}

struct ContextMetrics {
    compression_rounds: IntCounter,
    compression_failures: IntCounterVec,
    tokens_saved: IntCounter,
    messages_appended: IntCounterVec,
    summary_latency: Histogram,
}

impl ContextMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let compression_rounds = IntCounter::new(
            "compression_rounds_total",
            "Successful compression rounds",
        )?;
        let compression_failures = IntCounterVec::new(
            prometheus::opts!("compression_failures_total", "Failed compression attempts by kind"),
            &["kind"],
        )?;
        let tokens_saved = IntCounter::new(
            "compression_tokens_saved_total",
            "Tokens removed from active context by compression",
        )?;
        let messages_appended = IntCounterVec::new(
            prometheus::opts!("messages_appended_total", "Messages appended by role"),
            &["role"],
        )?;
        let summary_latency = Histogram::with_opts(HistogramOpts::new(
            "summary_latency_seconds",
            "Time spent waiting on the summarization backend",
        ))?;

        registry.register(Box::new(compression_rounds.clone()))?;
        registry.register(Box::new(compression_failures.clone()))?;
        registry.register(Box::new(tokens_saved.clone()))?;
        registry.register(Box::new(messages_appended.clone()))?;
        registry.register(Box::new(summary_latency.clone()))?;

        Ok(Self {
            compression_rounds,
            compression_failures,
            tokens_saved,
            messages_appended,
            summary_latency,
        })
    }
}

/// Force registration up front so the first scrape already lists every series.
pub fn init_metrics() {
    lazy_static::initialize(&METRICS);
}

pub fn inc_compression_round(saved_tokens: i64) {
    if let Some(m) = METRICS.as_ref() {
        m.compression_rounds.inc();
        if saved_tokens > 0 {
            m.tokens_saved.inc_by(saved_tokens as u64);
        }
    }
}

pub fn inc_compression_failure(kind: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.compression_failures.with_label_values(&[kind]).inc();
    }
}

pub fn inc_message_appended(role: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.messages_appended.with_label_values(&[role]).inc();
    }
}

pub fn observe_summary_latency(seconds: f64) {
    if let Some(m) = METRICS.as_ref() {
        m.summary_latency.observe(seconds);
    }
}

/// Prometheus text exposition of everything recorded so far.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
