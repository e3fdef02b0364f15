#![doc(issue_tracker_base_url = "https://github.com/stockcache/fabric/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Wires the cache fabric's tiers into one explicit dependency object and
//! exposes the façade an HTTP layer (out of scope for this crate) would
//! call into.
//!
//! - [`context`] - [`context::FabricContext`], init -> serve -> drain -> close
//! - [`orchestrator`] - [`orchestrator::AnalysisOrchestrator`], the
//!   cache/storage/upstream read-through path for `Analyze`
//! - [`maintenance`] - [`maintenance::BackgroundMaintenance`], the periodic
//!   expired-entry reaper
//! - [`provider`] - [`provider::MarketDataProvider`], the upstream
//!   market-data seam
//! - [`config`] - [`config::FabricConfig`], environment-driven runtime
//!   configuration

/// Environment-driven runtime configuration.
pub mod config;
/// The explicit dependency object tying every tier together.
pub mod context;
/// The periodic expired-entry reaper.
pub mod maintenance;
/// The analysis orchestrator.
pub mod orchestrator;
/// The upstream market-data provider seam.
pub mod provider;

pub use config::{FabricConfig, RuntimeMode};
pub use context::FabricContext;
pub use maintenance::BackgroundMaintenance;
pub use orchestrator::{AnalysisOrchestrator, AnalysisResult, Signal};
pub use provider::MarketDataProvider;

pub use cache_core::error::{FabricError, Result};
pub use cache_core::health::{HealthSnapshot, PerformanceSnapshot, TierHealth, TierStatus};
