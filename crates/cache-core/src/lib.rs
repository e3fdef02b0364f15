#![doc(issue_tracker_base_url = "https://github.com/stockcache/fabric/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core types, traits, and error taxonomy shared by every crate in the
//! cache fabric.
//!
//! - [`types`] - entity types moved through the fabric (symbols, bars,
//!   fundamentals, indicators, fx rates, the freshness-ledger entry)
//! - [`error`] - [`error::FabricError`], the fabric-wide error taxonomy
//! - [`fingerprint`] - canonical cache-key and parameter-fingerprint
//!   derivation
//! - [`ttl`] - default time-to-live policy per cache-key class
//! - [`storage`] - [`storage::StorageBackend`], the persistent/distributed
//!   tier's contract
//! - [`health`] - health and performance snapshot types

/// Error taxonomy for the cache fabric.
pub mod error;
/// Canonical cache-key and parameter-fingerprint derivation.
pub mod fingerprint;
/// Health and performance reporting types.
pub mod health;
/// The persistent/distributed storage tier's contract.
pub mod storage;
/// Core entity types.
pub mod types;
/// Default time-to-live policy per cache-key class.
pub mod ttl;

pub use error::{FabricError, Result};
pub use fingerprint::{analysis_cache_key, cache_key, fx_cache_key, parameter_fingerprint};
pub use health::{HealthSnapshot, PerformanceSnapshot, TierHealth, TierStatus};
pub use storage::{CacheStats, StorageBackend};
pub use ttl::default_ttl;
pub use types::{
    Bar, CacheMetadataEntry, DataType, Fundamental, FxRate, IndicatorParameters, IndicatorValue,
    Symbol, SymbolMetadata, SymbolRecord, SymbolUpdate,
};
