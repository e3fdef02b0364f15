//! The [`StorageBackend`] trait: the persistent/distributed tier's contract.
//!
//! Per the freshness-ledger resolution (OQ-1), this tier is not asked to
//! store opaque blobs keyed by cache key. It stores entity rows (symbols,
//! bars, fundamentals, indicators, fx rates) plus a metadata ledger of which
//! composite cache keys are still fresh. Callers reconstruct values from the
//! entity tables and consult the ledger only to decide whether a read can be
//! served without going upstream.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::types::{
    Bar, DataType, Fundamental, FxRate, IndicatorParameters, IndicatorValue, Symbol,
    SymbolMetadata, SymbolRecord, SymbolUpdate,
};

/// Point-in-time counters describing the storage tier's occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of live (non-expired) metadata entries.
    pub live_entries: u64,
    /// Total number of expired metadata entries awaiting reap.
    pub expired_entries: u64,
    /// Total bar rows stored.
    pub bar_rows: u64,
    /// Total fundamental rows stored.
    pub fundamental_rows: u64,
    /// Total indicator rows stored.
    pub indicator_rows: u64,
}

/// The persistent/distributed storage tier's contract.
///
/// Implementations back this with an embedded single-file database, a
/// hosted relational database, or (for tests) an in-memory map; callers
/// depend only on this trait, never on a concrete backend.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Returns the stored record for a symbol, if it exists.
    async fn get_symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>>;

    /// Inserts a new symbol, or replaces the metadata of an existing one,
    /// identified by its ticker.
    async fn upsert_symbol(&self, symbol: &Symbol, metadata: &SymbolMetadata) -> Result<SymbolRecord>;

    /// Applies a partial update to an existing symbol's metadata.
    ///
    /// Returns [`crate::error::FabricError::NotFound`] if the symbol isn't
    /// registered. A no-op `update` (all fields `None`) still refreshes
    /// `updated_at`.
    async fn update_symbol(&self, symbol: &Symbol, update: &SymbolUpdate) -> Result<SymbolRecord>;

    /// Returns bars for `symbol` within `[start, end]` inclusive, ordered by
    /// date ascending.
    async fn get_bars(&self, symbol: &Symbol, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>>;

    /// Returns the most recent bar on or before `as_of`, if any.
    async fn last_bar(&self, symbol: &Symbol, as_of: NaiveDate) -> Result<Option<Bar>>;

    /// Replaces (by `(symbol, date)`) or inserts every bar in `bars`.
    ///
    /// Writes as a single atomic batch: either every bar lands, or none do.
    async fn upsert_bars(&self, symbol: &Symbol, bars: &[Bar]) -> Result<()>;

    /// Returns fundamentals for `symbol` whose `period_ending` falls within
    /// `[start, end]` inclusive.
    async fn get_fundamentals(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Fundamental>>;

    /// Replaces (by `(symbol, metric_type, period_ending)`) or inserts every
    /// fundamental in `values`.
    async fn upsert_fundamentals(&self, symbol: &Symbol, values: &[Fundamental]) -> Result<()>;

    /// Returns indicator values for `symbol` within `[start, end]` inclusive,
    /// computed with exactly `parameters`.
    async fn get_indicators(
        &self,
        symbol: &Symbol,
        indicator_type: &str,
        parameters: &IndicatorParameters,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IndicatorValue>>;

    /// Replaces (by `(symbol, indicator_type, date, parameter_fingerprint)`)
    /// or inserts every indicator value in `values`.
    async fn upsert_indicators(
        &self,
        symbol: &Symbol,
        indicator_type: &str,
        values: &[IndicatorValue],
    ) -> Result<()>;

    /// Returns the currently active rate for `(from, to)`, if one exists and
    /// has not expired.
    async fn get_fx_rate(&self, from: &str, to: &str) -> Result<Option<FxRate>>;

    /// Returns the stored rate for `(from, to)` regardless of expiry, for
    /// callers (like inversion reuse) that need to evaluate freshness
    /// themselves.
    async fn get_fx_rate_raw(&self, from: &str, to: &str) -> Result<Option<FxRate>>;

    /// Replaces the active rate for `(rate.from_currency, rate.to_currency)`
    /// and appends it to that pair's permanent rate history.
    async fn upsert_fx_rate(&self, rate: &FxRate) -> Result<()>;

    /// Returns every historical observation for `(from, to)` with
    /// `observed_at` in `[start, end]`, ordered ascending.
    ///
    /// Unlike [`Self::get_fx_rate`], rows are never replaced: this is every
    /// rate ever written for the pair, not just the currently active one.
    async fn get_fx_rate_history(
        &self,
        from: &str,
        to: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FxRate>>;

    /// Returns true if `cache_key` has a metadata entry with `expires_at` in
    /// the future.
    async fn is_cache_valid(&self, cache_key: &str) -> Result<bool>;

    /// Records that `cache_key` was read or written, creating or refreshing
    /// its metadata entry with a new `expires_at` and incrementing its
    /// access counter.
    async fn touch_cache(&self, cache_key: &str, data_type: DataType, ttl: Duration) -> Result<()>;

    /// Deletes every metadata entry whose `expires_at` is at or before now.
    ///
    /// Returns the number of entries removed. Entity rows (bars,
    /// fundamentals, ...) are untouched; only the freshness ledger is
    /// pruned.
    async fn reap_expired_cache(&self) -> Result<u64>;

    /// Deletes the metadata entry for `cache_key`, if one exists.
    ///
    /// A no-op, not an error, if `cache_key` has no entry. Entity rows are
    /// untouched; only the freshness ledger is pruned.
    async fn delete_cache_entry(&self, cache_key: &str) -> Result<()>;

    /// Deletes every metadata entry, regardless of expiry.
    ///
    /// Entity rows (bars, fundamentals, ...) are untouched; only the
    /// freshness ledger is truncated.
    async fn clear_cache_metadata(&self) -> Result<()>;

    /// Returns current occupancy counters for health reporting.
    async fn stats(&self) -> Result<CacheStats>;

    /// Cheaply verifies the backend is reachable and can serve reads.
    async fn ping(&self) -> Result<()>;
}
