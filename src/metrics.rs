//! Prometheus metrics for the faucet and the ingest worker.
//!
//! Each `Metrics` owns its own registry so tests and the two binaries never
//! share counters.

use anyhow::{Context, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::limiter::Keyspace;

pub struct Metrics {
    pub registry: Registry,

    // HTTP
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // Admission
    pub admission_total: IntCounterVec,
    pub rate_limit_total: IntCounterVec,

    // Delivery
    pub ingest_total: IntCounterVec,
    pub ingest_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "Request duration"),
            &["method", "path"],
        )?;
        let admission_total = IntCounterVec::new(
            Opts::new("faucet_admission_total", "Admission decisions by keyspace"),
            &["keyspace", "outcome"], // allowed, denied
        )?;
        let rate_limit_total = IntCounterVec::new(
            Opts::new("faucet_rate_limit_total", "Rate limit hits"),
            &["type"],
        )?;
        let ingest_total = IntCounterVec::new(
            Opts::new("arkiv_ingest_total", "Ingestion attempts"),
            &["status"], // ok, error
        )?;
        let ingest_duration_seconds = HistogramVec::new(
            HistogramOpts::new("arkiv_ingest_duration_seconds", "Ingest latency"),
            &["status"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(admission_total.clone()))?;
        registry.register(Box::new(rate_limit_total.clone()))?;
        registry.register(Box::new(ingest_total.clone()))?;
        registry.register(Box::new(ingest_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            admission_total,
            rate_limit_total,
            ingest_total,
            ingest_duration_seconds,
        })
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, status_label(status)])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_admission(&self, keyspace: Keyspace, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.admission_total
            .with_label_values(&[keyspace.label(), outcome])
            .inc();
        if !allowed {
            self.rate_limit_total
                .with_label_values(&[keyspace.label()])
                .inc();
        }
    }

    /// Counts a finished delivery cycle. `duration_secs` is `None` when nothing
    /// was delivered (e.g. the fetch failed).
    pub fn record_ingest(&self, ok: bool, duration_secs: Option<f64>) {
        let status = if ok { "ok" } else { "error" };
        self.ingest_total.with_label_values(&[status]).inc();
        if let Some(secs) = duration_secs {
            self.ingest_duration_seconds
                .with_label_values(&[status])
                .observe(secs);
        }
    }

    pub fn ingest_count(&self, status: &str) -> u64 {
        self.ingest_total.with_label_values(&[status]).get()
    }

    pub fn rate_limit_count(&self, keyspace: Keyspace) -> u64 {
        self.rate_limit_total
            .with_label_values(&[keyspace.label()])
            .get()
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not UTF-8")
    }
}

pub fn status_label(code: u16) -> &'static str {
    match code {
        500..=u16::MAX => "5xx",
        400..=499 => "4xx",
        300..=399 => "3xx",
        200..=299 => "2xx",
        _ => "unknown",
    }
}
