//! Prometheus metrics for lease and scope lifecycle
//!
//! Each collector owns its own [`Registry`] so several engines can live in one
//! process (and in one test binary) without name clashes.

use crate::error::Result;
use crate::store::LeaseKind;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};

pub struct LeaseMetrics {
    registry: Registry,

    active_exclusive: IntGauge,
    active_shared: IntGauge,
    acquired_total: IntCounterVec,
    released_total: IntCounterVec,
    breaks_total: IntCounter,
    save_conflicts_total: IntCounter,
}

impl LeaseMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_exclusive = IntGauge::new(
            "strand_active_exclusive_leases",
            "Exclusive leases currently held",
        )?;
        let active_shared = IntGauge::new(
            "strand_active_shared_scopes",
            "Shared-lease scopes currently open",
        )?;
        let acquired_total = IntCounterVec::new(
            Opts::new("strand_lease_acquired_total", "Leases acquired"),
            &["kind"],
        )?;
        let released_total = IntCounterVec::new(
            Opts::new("strand_lease_released_total", "Leases released"),
            &["kind"],
        )?;
        let breaks_total = IntCounter::new(
            "strand_lease_breaks_total",
            "Foreign leases broken to acquire exclusive access",
        )?;
        let save_conflicts_total = IntCounter::new(
            "strand_save_conflicts_total",
            "Snapshot saves rejected by an etag mismatch",
        )?;

        registry.register(Box::new(active_exclusive.clone()))?;
        registry.register(Box::new(active_shared.clone()))?;
        registry.register(Box::new(acquired_total.clone()))?;
        registry.register(Box::new(released_total.clone()))?;
        registry.register(Box::new(breaks_total.clone()))?;
        registry.register(Box::new(save_conflicts_total.clone()))?;

        Ok(LeaseMetrics {
            registry,
            active_exclusive,
            active_shared,
            acquired_total,
            released_total,
            breaks_total,
            save_conflicts_total,
        })
    }

    pub fn record_acquire(&self, kind: LeaseKind) {
        self.acquired_total.with_label_values(&[kind.as_str()]).inc();
        self.active(kind).inc();
    }

    pub fn record_release(&self, kind: LeaseKind) {
        self.released_total.with_label_values(&[kind.as_str()]).inc();
        self.active(kind).dec();
    }

    pub fn record_break(&self) {
        self.breaks_total.inc();
    }

    pub fn record_save_conflict(&self) {
        self.save_conflicts_total.inc();
    }

    fn active(&self, kind: LeaseKind) -> &IntGauge {
        match kind {
            LeaseKind::Exclusive => &self.active_exclusive,
            LeaseKind::Shared => &self.active_shared,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let acquired = |kind: LeaseKind| self.acquired_total.with_label_values(&[kind.as_str()]).get();
        let released = |kind: LeaseKind| self.released_total.with_label_values(&[kind.as_str()]).get();

        MetricsSnapshot {
            active_exclusive: self.active_exclusive.get(),
            active_shared: self.active_shared.get(),
            acquired_total: acquired(LeaseKind::Exclusive) + acquired(LeaseKind::Shared),
            released_total: released(LeaseKind::Exclusive) + released(LeaseKind::Shared),
            breaks_total: self.breaks_total.get(),
            save_conflicts_total: self.save_conflicts_total.get(),
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Point-in-time counter values for JSON export and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_exclusive: i64,
    pub active_shared: i64,
    pub acquired_total: u64,
    pub released_total: u64,
    pub breaks_total: u64,
    pub save_conflicts_total: u64,
}
