// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Prometheus metrics, grounded in the teacher's own `metrics.rs` use of
//! `prometheus-client` plus an `axum` `/metrics` endpoint, generalized from
//! Forest's node metrics to the four per-role gauges/counters/histograms
//! this pipeline exposes (spec.md §7's observability surface).

use std::{net::SocketAddr, sync::atomic::AtomicU64, sync::Arc};

use axum::{extract::State, routing::get, Router};
use prometheus_client::{
    encoding::text::encode,
    metrics::{gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

const DURATION_BUCKETS: [f64; 11] = [1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 2400.0, 3600.0];

/// Per-role metrics. Each role only touches the fields relevant to it; the
/// rest sit at zero, which is cheap and keeps one registry/port per process
/// (matching the original's one Prometheus port per systemd unit).
///
/// `queue_processed`/`queue_failed` are modeled as [`Gauge`]s rather than
/// monotonic counters: the original `Metrics.set_total` resets both to zero
/// on every polling pass (spec.md §6), a shape plain Prometheus counters
/// can't express without resetting the whole process.
pub struct PipelineMetrics {
    registry: Registry,
    pub queue_total: Gauge,
    pub queue_processed: Gauge,
    pub queue_failed: Gauge,
    pub progress_ratio: Gauge<f64, AtomicU64>,
    pub download_duration_seconds: Histogram,
    pub upload_duration_seconds: Histogram,
    pub processing_duration_seconds: Histogram,
    pub tool_reentrant_total: Gauge,
}

impl PipelineMetrics {
    pub fn new(role: &str) -> Self {
        let mut registry = Registry::with_prefix(format!("forest_snapshot_{role}"));

        let queue_total = Gauge::default();
        registry.register(
            "queue_total",
            "Number of ready messages observed on the main queue at the start of a pass",
            queue_total.clone(),
        );

        let queue_processed = Gauge::default();
        registry.register(
            "queue_processed",
            "Messages successfully processed and acked since the last set_total call",
            queue_processed.clone(),
        );

        let queue_failed = Gauge::default();
        registry.register(
            "queue_failed",
            "Messages rejected to the dead-letter queue since the last set_total call",
            queue_failed.clone(),
        );

        let progress_ratio = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "progress_ratio",
            "(processed + failed) / total as of the last set_total call",
            progress_ratio.clone(),
        );

        let download_duration_seconds = Histogram::new(DURATION_BUCKETS.into_iter());
        registry.register(
            "download_duration_seconds",
            "Wall-clock time spent reading input for one message",
            download_duration_seconds.clone(),
        );

        let upload_duration_seconds = Histogram::new(DURATION_BUCKETS.into_iter());
        registry.register(
            "upload_duration_seconds",
            "Wall-clock time spent writing the artifact to object storage",
            upload_duration_seconds.clone(),
        );

        let processing_duration_seconds = Histogram::new(DURATION_BUCKETS.into_iter());
        registry.register(
            "processing_duration_seconds",
            "Wall-clock time to process one message to completion",
            processing_duration_seconds.clone(),
        );

        let tool_reentrant_total = Gauge::default();
        registry.register(
            "tool_reentrant_total",
            "Times the chain tool reported its global lock already held",
            tool_reentrant_total.clone(),
        );

        Self {
            registry,
            queue_total,
            queue_processed,
            queue_failed,
            progress_ratio,
            download_duration_seconds,
            upload_duration_seconds,
            processing_duration_seconds,
            tool_reentrant_total,
        }
    }

    /// Overwrite the queue-depth gauge and reset the success/failure
    /// counters, matching `Metrics.set_total`'s "set, don't increment"
    /// refresh at the top of each polling pass (spec.md §6).
    pub fn set_total(&self, value: i64) {
        self.queue_total.set(value);
        self.queue_processed.set(0);
        self.queue_failed.set(0);
        self.progress_ratio.set(0.0);
    }

    /// Recompute the progress ratio from the current processed/failed/total
    /// counts. Called after each `inc()` on `queue_processed`/`queue_failed`
    /// so `/metrics` always reflects the latest pass's completion fraction.
    pub fn refresh_progress_ratio(&self) {
        let total = self.queue_total.get();
        if total <= 0 {
            self.progress_ratio.set(0.0);
            return;
        }
        let done = self.queue_processed.get() + self.queue_failed.get();
        self.progress_ratio.set(done as f64 / total as f64);
    }
}

async fn metrics_handler(State(metrics): State<Arc<PipelineMetrics>>) -> String {
    let mut buf = String::new();
    encode(&mut buf, &metrics.registry).unwrap_or_else(|e| {
        buf = format!("# encode error: {e}\n");
    });
    buf
}

/// Serve `/metrics` on `bind:port` until the process exits. Spawned as a
/// background task alongside each worker's main loop.
pub async fn serve(metrics: Arc<PipelineMetrics>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_total_overwrites_rather_than_accumulates() {
        let metrics = PipelineMetrics::new("compute");
        metrics.set_total(5);
        metrics.set_total(2);
        assert_eq!(metrics.queue_total.get(), 2);
    }

    #[test]
    fn counters_start_at_zero() {
        let metrics = PipelineMetrics::new("build");
        assert_eq!(metrics.queue_processed.get(), 0);
        assert_eq!(metrics.queue_failed.get(), 0);
        assert_eq!(metrics.tool_reentrant_total.get(), 0);
    }
}
