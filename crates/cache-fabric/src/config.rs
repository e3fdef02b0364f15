//! Environment-driven runtime configuration.
//!
//! Loaded the way the teacher's binaries load configuration: `std::env::var`
//! with sensible defaults, no config-file parser (the corpus this crate is
//! grown from doesn't introduce one either).

use std::time::Duration;

/// Selects which storage backend the fabric runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Single-file embedded storage (sqlite).
    Embedded,
    /// Hosted relational storage (postgres).
    Hosted,
}

impl RuntimeMode {
    fn from_env_value(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "hosted" | "postgres" => Self::Hosted,
            _ => Self::Embedded,
        }
    }
}

/// Environment inputs the fabric needs at startup.
///
/// Mirrors the external-interfaces environment table: runtime mode selector,
/// market-data API key, FX API key, optional max in-memory entry count,
/// background-loop interval.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Whether to run against the embedded (sqlite) or hosted (postgres)
    /// storage backend.
    pub runtime_mode: RuntimeMode,
    /// API key for the upstream market-data provider. `None` disables
    /// upstream fetches; the fabric then serves cache/storage hits only.
    pub market_data_api_key: Option<String>,
    /// API key for keyed FX providers (provider A and C). `None` restricts
    /// FX acquisition to the keyless provider and cache/inversion reuse.
    pub fx_api_key: Option<String>,
    /// Upper bound on in-process tier entries per data-type class.
    pub max_in_memory_entries: u64,
    /// Interval between background maintenance sweeps.
    pub background_interval: Duration,
    /// Gates the OQ-4 approximate-OHLC-synthesis fallback. Default `false`:
    /// a symbol with only close prices surfaces as insufficient data rather
    /// than silently synthesizing open/high/low from close.
    pub synthesize_ohlc_from_close: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            runtime_mode: RuntimeMode::Embedded,
            market_data_api_key: None,
            fx_api_key: None,
            max_in_memory_entries: 10_000,
            background_interval: Duration::from_secs(3600),
            synthesize_ohlc_from_close: false,
        }
    }
}

impl FabricConfig {
    /// Loads configuration from the process environment, falling back to
    /// [`FabricConfig::default`] for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            runtime_mode: std::env::var("CACHE_FABRIC_MODE")
                .map(|v| RuntimeMode::from_env_value(&v))
                .unwrap_or(defaults.runtime_mode),
            market_data_api_key: std::env::var("MARKET_DATA_API_KEY").ok(),
            fx_api_key: std::env::var("FX_API_KEY").ok(),
            max_in_memory_entries: std::env::var("CACHE_MAX_IN_MEMORY_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_in_memory_entries),
            background_interval: std::env::var("CACHE_BACKGROUND_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.background_interval),
            synthesize_ohlc_from_close: std::env::var("CACHE_SYNTHESIZE_OHLC_FROM_CLOSE")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.synthesize_ohlc_from_close),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_embedded_and_synthesis_off() {
        let config = FabricConfig::default();
        assert_eq!(config.runtime_mode, RuntimeMode::Embedded);
        assert!(!config.synthesize_ohlc_from_close);
    }

    #[test]
    fn unrecognized_mode_value_falls_back_to_embedded() {
        assert_eq!(RuntimeMode::from_env_value("nonsense"), RuntimeMode::Embedded);
        assert_eq!(RuntimeMode::from_env_value("HOSTED"), RuntimeMode::Hosted);
    }
}
