//! The upstream market-data provider seam.
//!
//! The wire protocol of any concrete upstream is out of scope; this trait is
//! the minimal capability the [`crate::orchestrator::AnalysisOrchestrator`]
//! needs from one, shaped after `PriceDataProvider`/`DataProvider` in the
//! corpus this crate is grown from.

use async_trait::async_trait;
use cache_core::error::Result;
use cache_core::types::Symbol;
use cache_normalize::{CorporateAction, RawBar};
use chrono::NaiveDate;

/// A source of raw OHLCV bars and corporate actions for the normalization
/// pipeline.
#[async_trait]
pub trait MarketDataProvider: Send + Sync + std::fmt::Debug {
    /// Human-readable identifier recorded on fetched bars.
    fn name(&self) -> &str;

    /// Fetches raw bars for `symbol` within `[start, end]` inclusive.
    async fn fetch_bars(&self, symbol: &Symbol, start: NaiveDate, end: NaiveDate) -> Result<Vec<RawBar>>;

    /// Fetches every known corporate action for `symbol`.
    async fn fetch_corporate_actions(&self, symbol: &Symbol) -> Result<Vec<CorporateAction>>;
}
