//! Metrics collection for observability
//!
//! Prometheus collectors for the custody actor, registered in a registry
//! owned by each [`Metrics`] instance so several ledgers can share a process.
//!
//! # Metrics
//!
//! - `custody_commands_total{command, outcome}` - Commands processed
//! - `custody_command_duration_seconds` - Histogram of commit latencies
//! - `custody_events_total` - Journal records appended
//! - `custody_violations_total{kind}` - Violations opened
//! - `custody_blacklisted_holders` - Currently blacklisted holders
//! - `custody_batches` - Batch records in the store

use crate::events::CustodyEvent;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Commands by name and outcome (`ok` or an error kind)
    pub commands_total: IntCounterVec,

    /// Commit duration histogram
    pub command_duration: Histogram,

    /// Journal records appended
    pub events_total: IntCounter,

    /// Violations opened, by kind
    pub violations_total: IntCounterVec,

    /// Blacklisted holders
    pub blacklisted_holders: IntGauge,

    /// Batch records
    pub batches: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let commands_total = IntCounterVec::new(
            Opts::new("custody_commands_total", "Commands processed"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let command_duration = Histogram::with_opts(
            HistogramOpts::new(
                "custody_command_duration_seconds",
                "Histogram of command commit latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let events_total = IntCounter::new("custody_events_total", "Journal records appended")?;
        registry.register(Box::new(events_total.clone()))?;

        let violations_total = IntCounterVec::new(
            Opts::new("custody_violations_total", "Violations opened"),
            &["kind"],
        )?;
        registry.register(Box::new(violations_total.clone()))?;

        let blacklisted_holders =
            IntGauge::new("custody_blacklisted_holders", "Currently blacklisted holders")?;
        registry.register(Box::new(blacklisted_holders.clone()))?;

        let batches = IntGauge::new("custody_batches", "Batch records in the store")?;
        registry.register(Box::new(batches.clone()))?;

        Ok(Self {
            commands_total,
            command_duration,
            events_total,
            violations_total,
            blacklisted_holders,
            batches,
            registry,
        })
    }

    /// Record a processed command
    pub fn record_command(&self, command: &str, outcome: &str, duration_seconds: f64) {
        self.commands_total
            .with_label_values(&[command, outcome])
            .inc();
        self.command_duration.observe(duration_seconds);
    }

    /// Record committed events
    pub fn record_events(&self, events: &[&CustodyEvent]) {
        self.events_total.inc_by(events.len() as u64);
        for event in events {
            match event {
                CustodyEvent::AbusiveStorageDetected { .. } => self
                    .violations_total
                    .with_label_values(&["excessive_storage"])
                    .inc(),
                CustodyEvent::QuantityOverflowDetected { .. } => self
                    .violations_total
                    .with_label_values(&["quantity_overflow"])
                    .inc(),
                _ => {}
            }
        }
    }

    /// Update state gauges
    pub fn update_gauges(&self, blacklisted: usize, batches: usize) {
        self.blacklisted_holders.set(blacklisted as i64);
        self.batches.set(batches as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("events_total", &self.events_total.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, BatchId, ViolationId};
    use chrono::Utc;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.events_total.get(), 0);
        // A second instance does not collide with the first
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_command() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("produce", "ok", 0.001);
        metrics.record_command("produce", "unauthorized", 0.001);
        metrics.record_command("produce", "ok", 0.002);

        assert_eq!(
            metrics
                .commands_total
                .with_label_values(&["produce", "ok"])
                .get(),
            2
        );
        assert_eq!(metrics.command_duration.get_sample_count(), 3);
    }

    #[test]
    fn test_record_events_counts_violations() {
        let metrics = Metrics::new().unwrap();
        let detected = CustodyEvent::AbusiveStorageDetected {
            violation_id: ViolationId(1),
            holder: Address::from_low_u64(2),
            batch_id: BatchId(1),
            balance: 1_500,
            at: Utc::now(),
        };
        let expired = CustodyEvent::BatchExpired {
            batch_id: BatchId(1),
            holder: Address::from_low_u64(2),
            at: Utc::now(),
        };

        metrics.record_events(&[&expired, &detected]);

        assert_eq!(metrics.events_total.get(), 2);
        assert_eq!(
            metrics
                .violations_total
                .with_label_values(&["excessive_storage"])
                .get(),
            1
        );
        assert!(metrics.render().contains("custody_events_total 2"));
    }

    #[test]
    fn test_update_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.update_gauges(2, 40);
        assert_eq!(metrics.blacklisted_holders.get(), 2);
        assert_eq!(metrics.batches.get(), 40);
    }
}
