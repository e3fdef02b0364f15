//! Health and performance reporting types surfaced to operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::CacheStats;

/// Reachability state of a single tier or upstream dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierStatus {
    /// The tier answered a liveness probe within budget.
    Healthy,
    /// The tier answered but is degraded (elevated latency, partial outage).
    Degraded,
    /// The tier did not answer, or answered with an error.
    Unavailable,
}

/// Liveness and occupancy snapshot for one dependency (a storage backend,
/// an FX provider, the in-process tier).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierHealth {
    /// Human-readable name of the tier (`"storage"`, `"fx:provider-a"`, ...).
    pub name: String,
    /// Current reachability state.
    pub status: TierStatus,
    /// Round-trip latency of the probe that produced this snapshot.
    pub latency: std::time::Duration,
    /// Detail message, populated when `status != Healthy`.
    pub detail: Option<String>,
}

/// Aggregate health snapshot across every tier and upstream dependency,
/// returned by the fabric's health endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When this snapshot was assembled.
    pub checked_at: DateTime<Utc>,
    /// Overall status: worst of the individual tier statuses.
    pub overall: TierStatus,
    /// Per-dependency detail.
    pub tiers: Vec<TierHealth>,
    /// Storage occupancy counters, when storage answered.
    pub cache_stats: Option<CacheStats>,
}

impl HealthSnapshot {
    /// Derives the overall status as the worst status among `tiers`.
    #[must_use]
    pub fn worst_of(tiers: &[TierHealth]) -> TierStatus {
        let mut worst = TierStatus::Healthy;
        for tier in tiers {
            worst = match (worst, tier.status) {
                (_, TierStatus::Unavailable) | (TierStatus::Unavailable, _) => {
                    TierStatus::Unavailable
                }
                (_, TierStatus::Degraded) | (TierStatus::Degraded, _) => TierStatus::Degraded,
                _ => TierStatus::Healthy,
            };
        }
        worst
    }
}

/// Rolling read/write performance counters for a single tier, used by
/// background maintenance to surface hit-rate and latency trends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Reads served without falling through to the next tier.
    pub hits: u64,
    /// Reads that fell through to the next tier or upstream.
    pub misses: u64,
    /// Writes performed (population + explicit upserts).
    pub writes: u64,
    /// Requests that coalesced onto an in-flight populate instead of
    /// triggering their own upstream fetch.
    pub coalesced: u64,
    /// Entries removed by TTL expiry or size-based LRU eviction.
    pub evictions: u64,
}

impl PerformanceSnapshot {
    /// Hit rate in `[0.0, 1.0]`. Returns `0.0` when no reads were recorded.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_of_empty_is_healthy() {
        assert_eq!(HealthSnapshot::worst_of(&[]), TierStatus::Healthy);
    }

    #[test]
    fn worst_of_prefers_unavailable_over_degraded() {
        let tiers = vec![
            TierHealth {
                name: "storage".into(),
                status: TierStatus::Degraded,
                latency: std::time::Duration::from_millis(5),
                detail: None,
            },
            TierHealth {
                name: "fx:provider-a".into(),
                status: TierStatus::Unavailable,
                latency: std::time::Duration::from_millis(5),
                detail: Some("timeout".into()),
            },
        ];
        assert_eq!(HealthSnapshot::worst_of(&tiers), TierStatus::Unavailable);
    }

    #[test]
    fn hit_rate_with_no_reads_is_zero() {
        let perf = PerformanceSnapshot::default();
        assert_eq!(perf.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_computed_correctly() {
        let perf = PerformanceSnapshot {
            hits: 3,
            misses: 1,
            writes: 0,
            coalesced: 0,
            evictions: 0,
        };
        assert_eq!(perf.hit_rate(), 0.75);
    }
}
