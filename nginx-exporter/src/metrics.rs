//! Prometheus instruments for the exporter.
//!
//! Everything is registered into a caller-provided [`Registry`] rather than the process-wide
//! default, so tests can build isolated instances. Naming follows Prometheus conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use crate::pipeline::DrainSummary;
use anyhow::{bail, Context, Result};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

pub const UPSTREAM_DURATION_METRIC: &str = "upstream_response_duration_seconds";
pub const URI_LABEL: &str = "uri";

pub const DEFAULT_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Destination for per-line observations.
///
/// Implementations must not block; the pipeline logs and counts errors but keeps going.
pub trait MetricSink: Send + Sync {
    fn observe(&self, label: &str, value: f64) -> Result<()>;
}

/// Upstream response time histogram keyed by request URI.
#[derive(Clone)]
pub struct UpstreamMetrics {
    duration: HistogramVec,
}

impl UpstreamMetrics {
    pub fn new(registry: &Registry, buckets: Vec<f64>) -> Result<Self> {
        validate_buckets(&buckets)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                UPSTREAM_DURATION_METRIC,
                "Duration of upstream responses by URI",
            )
            .buckets(buckets),
            &[URI_LABEL],
        )
        .context("failed to build upstream duration histogram")?;

        registry
            .register(Box::new(duration.clone()))
            .context("failed to register upstream duration histogram")?;

        Ok(Self { duration })
    }
}

impl MetricSink for UpstreamMetrics {
    fn observe(&self, label: &str, value: f64) -> Result<()> {
        self.duration
            .get_metric_with_label_values(&[label])
            .with_context(|| format!("failed to resolve histogram for uri {label:?}"))?
            .observe(value);
        Ok(())
    }
}

/// Histogram children are built lazily, so bucket errors would otherwise surface on the first
/// observation instead of at startup.
pub fn validate_buckets(buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        bail!("histogram buckets cannot be empty");
    }
    if let Some(bad) = buckets.iter().find(|bound| !bound.is_finite()) {
        bail!("histogram bucket {bad} is not a finite number");
    }
    if let Some(pair) = buckets.windows(2).find(|pair| pair[0] >= pair[1]) {
        bail!(
            "histogram buckets must be strictly increasing; {} is followed by {}",
            pair[0],
            pair[1]
        );
    }
    Ok(())
}

/// Counters describing the exporter's own progress.
#[derive(Clone)]
pub struct ExporterMetrics {
    lines: IntCounterVec,
    drains: IntCounter,
    read_offset: IntGauge,
}

impl ExporterMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let lines = IntCounterVec::new(
            Opts::new(
                "nginx_exporter_lines_total",
                "Access log lines processed by outcome",
            ),
            &["outcome"],
        )?;
        let drains = IntCounter::new(
            "nginx_exporter_drains_total",
            "Drain passes triggered by file notifications",
        )?;
        let read_offset = IntGauge::new(
            "nginx_exporter_read_offset_bytes",
            "Byte offset just past the last consumed line",
        )?;

        registry
            .register(Box::new(lines.clone()))
            .context("failed to register line counter")?;
        registry
            .register(Box::new(drains.clone()))
            .context("failed to register drain counter")?;
        registry
            .register(Box::new(read_offset.clone()))
            .context("failed to register read offset gauge")?;

        Ok(Self {
            lines,
            drains,
            read_offset,
        })
    }

    pub fn record_drain(&self, summary: &DrainSummary, consumed_offset: u64) {
        self.drains.inc();
        for (outcome, count) in [
            ("parsed", summary.parsed),
            ("unmatched", summary.unmatched),
            ("rejected", summary.rejected),
            ("sink_error", summary.sink_errors),
        ] {
            if count > 0 {
                self.lines.with_label_values(&[outcome]).inc_by(count);
            }
        }
        self.read_offset
            .set(i64::try_from(consumed_offset).unwrap_or(i64::MAX));
    }
}
