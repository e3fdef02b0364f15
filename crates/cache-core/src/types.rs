//! Core entity types for the cache fabric.
//!
//! This module defines the persisted/cached shapes the rest of the fabric
//! moves around:
//!
//! - [`Symbol`] - canonical, case-folded ticker identity
//! - [`SymbolRecord`] - a symbol's stored metadata row
//! - [`Bar`] - one OHLCV record for one symbol on one date
//! - [`Fundamental`] - one reported fundamental metric
//! - [`IndicatorValue`] - one computed indicator value
//! - [`FxRate`] - one currency-pair exchange rate
//! - [`CacheMetadataEntry`] - a freshness-ledger row for a cache key
//! - [`DataType`] - the cache-key class used for TTL selection and metadata

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trading symbol/ticker.
///
/// Symbols are always uppercased (ASCII) at construction, matching the
/// casefold boundary described for cache keys and storage lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Creates a new symbol from a string, uppercasing it.
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().to_ascii_uppercase())
    }

    /// Returns the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A symbol's stored reference metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    /// Surrogate integer id, used for joins in the relational stores.
    pub id: i64,
    /// Canonical, case-folded ticker.
    pub symbol: Symbol,
    /// Display name.
    pub name: Option<String>,
    /// Native trading currency (ISO 4217 code).
    pub currency: String,
    /// Primary exchange.
    pub exchange: Option<String>,
    /// ISIN, if known.
    pub isin: Option<String>,
    /// Creation timestamp. Never changes after insert.
    pub created_at: DateTime<Utc>,
    /// Last metadata update. Monotonically non-decreasing per id.
    pub updated_at: DateTime<Utc>,
}

/// Mutable fields accepted by a partial [`SymbolRecord`] update.
///
/// A closed struct instead of a dynamic field->value bag, per the
/// "dynamic parameter bags" redesign: every recognized option is named.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolUpdate {
    /// New display name, if changed.
    pub name: Option<String>,
    /// New native currency, if changed.
    pub currency: Option<String>,
    /// New exchange, if changed.
    pub exchange: Option<String>,
    /// New ISIN, if changed.
    pub isin: Option<String>,
}

impl SymbolUpdate {
    /// Returns true if every field is unset (a no-op update).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.currency.is_none()
            && self.exchange.is_none()
            && self.isin.is_none()
    }
}

/// Metadata accepted when creating or upserting a [`SymbolRecord`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolMetadata {
    /// Display name.
    pub name: Option<String>,
    /// Native trading currency (ISO 4217 code). Defaults to `"USD"` if unset.
    pub currency: Option<String>,
    /// Primary exchange.
    pub exchange: Option<String>,
    /// ISIN, if known.
    pub isin: Option<String>,
}

/// One OHLCV bar for one symbol on one date.
///
/// Keyed by `(symbol_id, date)`; re-insertion for the same key replaces the
/// prior row, it is never duplicated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Calendar date of the bar (no intraday timestamp in this model).
    pub date: NaiveDate,
    /// Opening price.
    pub open: f64,
    /// Highest price during the period.
    pub high: f64,
    /// Lowest price during the period.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Trading volume.
    pub volume: f64,
    /// Split/dividend-adjusted close. Defaults to `close` when not computed.
    pub adjusted_close: f64,
    /// Cumulative split ratio applied to reach this bar. Default `1.0`.
    pub split_ratio: f64,
    /// Dividend amount paid on or before this bar's date. Default `0.0`.
    pub dividend: f64,
    /// Trading currency for the raw prices.
    pub currency: String,
    /// Identifier of the upstream provider that supplied this bar.
    pub data_source: String,
}

impl Bar {
    /// Validates the invariants a stored bar must satisfy:
    /// `low <= {open, close, high}`, `low <= high`, `volume >= 0`, `close > 0`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.low <= self.high
            && self.volume >= 0.0
            && self.close > 0.0
    }
}

/// One reported fundamental metric.
///
/// Keyed by `(symbol_id, metric_type, period_ending)`; replace-on-conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fundamental {
    /// Metric name (e.g. `"revenue"`, `"net_income"`, `"pe_ratio"`).
    pub metric_type: String,
    /// End of the reporting period this value applies to.
    pub period_ending: NaiveDate,
    /// The reported numeric value.
    pub value: f64,
    /// Currency of the value, where applicable.
    pub currency: Option<String>,
    /// Date the figure was reported/published.
    pub reported_at: NaiveDate,
    /// Identifier of the upstream provider that supplied this value.
    pub data_source: String,
}

/// Recognized configuration options for a computed indicator, serialized
/// through [`crate::fingerprint::parameter_fingerprint`] to key storage rows.
///
/// A closed map rather than an open bag: callers declare the subset of
/// fields they use (e.g. `{period}` for SMA, `{fast_period, slow_period,
/// signal_period}` for MACD); unused fields stay `None` and are omitted from
/// the fingerprint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParameters {
    /// Lookback period (SMA, RSI, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
    /// Fast EMA period (MACD).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_period: Option<u32>,
    /// Slow EMA period (MACD).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_period: Option<u32>,
    /// Signal line period (MACD).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_period: Option<u32>,
    /// Standard deviation multiplier (Bollinger Bands).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
}

/// One computed indicator value, opaque to the cache fabric beyond its key
/// and a value payload.
///
/// Keyed by `(symbol_id, indicator_type, date, parameter_fingerprint)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    /// Indicator name (e.g. `"RSI"`, `"SMA"`, `"MACD"`).
    pub indicator_type: String,
    /// Date the value applies to.
    pub date: NaiveDate,
    /// Parameters used to compute this value, kept for audit.
    pub parameters: IndicatorParameters,
    /// The computed scalar value. Structured indicators (e.g. MACD) encode
    /// their components in `value_json`.
    pub value: Option<f64>,
    /// Structured value payload for indicators with more than one component.
    pub value_json: Option<serde_json::Value>,
}

/// One currency-pair exchange rate.
///
/// Keyed by the ordered pair `(from_currency, to_currency)`; replace-on-conflict.
/// At most one row per pair is ever active; `expires_at <= now` marks it
/// expired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FxRate {
    /// Source currency (ISO 4217).
    pub from_currency: String,
    /// Target currency (ISO 4217).
    pub to_currency: String,
    /// Current rate: `amount_in_to = amount_in_from * rate`.
    pub rate: f64,
    /// Rate as returned by the provider, before any local adjustment.
    pub source_rate: f64,
    /// Expiry of this row. A rate with `expires_at == now` is expired.
    pub expires_at: DateTime<Utc>,
    /// Identifier of the upstream provider that supplied this rate.
    pub data_source: String,
}

/// The cache-key class used to select a default TTL and tag metadata rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// OHLCV price series.
    Ohlcv,
    /// Computed indicator values.
    Indicator,
    /// Fundamental financial metrics.
    Fundamental,
    /// FX rates.
    Fx,
    /// Composite orchestrator analysis responses.
    Analysis,
    /// Catalog fallback for keys that don't fit another class.
    Unknown,
}

impl DataType {
    /// Returns the wire-format class token used in composite cache keys
    /// (`ohlcv|indicators|fundamentals|analyze|fx`).
    #[must_use]
    pub const fn key_class(self) -> &'static str {
        match self {
            Self::Ohlcv => "ohlcv",
            Self::Indicator => "indicators",
            Self::Fundamental => "fundamentals",
            Self::Fx => "fx",
            Self::Analysis => "analyze",
            Self::Unknown => "unknown",
        }
    }
}

/// A freshness-ledger row for an opaque cache key.
///
/// Per OQ-1, the persistent tier is treated as a freshness ledger, not a
/// value store: `IsCacheValid` answers "is this key still fresh", and
/// values are reconstructed from the entity tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadataEntry {
    /// The opaque cache key, as produced by [`crate::fingerprint::cache_key`].
    pub cache_key: String,
    /// Expiry for this entry. Entries with `expires_at <= now` are tombstone
    /// candidates for [`crate::storage::StorageBackend::reap_expired_cache`].
    pub expires_at: DateTime<Utc>,
    /// Cache-key class.
    pub data_type: DataType,
    /// Number of times this key has been touched (read or written) since
    /// first insert.
    pub access_count: u64,
    /// Last time this key was touched.
    pub last_accessed: DateTime<Utc>,
}
