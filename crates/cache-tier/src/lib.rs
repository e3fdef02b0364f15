#![doc(issue_tracker_base_url = "https://github.com/stockcache/fabric/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! The in-process cache tier: a `moka`-backed, TTL- and size-bounded cache
//! plus single-flight request coalescing for populate calls that miss it.
//!
//! - [`CacheTierManager`] - the L1 cache itself, with the full tier
//!   operation set (`Get`/`Set`/`Delete`/`Clear`/`Stats`/`EnforceMaxSize`),
//!   per-entry TTL, a fall-through to a [`cache_core::storage::StorageBackend`]'s
//!   freshness ledger on a local miss, and an eager [`Sweepable`] expiry
//!   sweep for background maintenance to drive
//! - [`SingleFlight`] - coalesces concurrent populate calls for one key

/// The cache tier manager: full operation set plus the three-tier read path.
pub mod manager;
/// Single-flight request coalescing.
pub mod single_flight;

pub use manager::{CacheTierManager, ReadOutcome, Sweepable};
pub use single_flight::SingleFlight;
