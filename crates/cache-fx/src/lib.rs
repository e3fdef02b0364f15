//! FX rate acquisition, provider failover, and conversion.
//!
//! [`provider`] defines the [`provider::FxRateProvider`] trait and the
//! provider chain queried on a cache miss. [`service`] implements
//! [`service::FxService`], the acquisition order (cache, inversion,
//! failover), conversion, batching, and history.

pub mod provider;
pub mod service;

pub use provider::{FxRateProvider, ProviderA, ProviderB, ProviderC};
pub use service::{ConvertOutcome, ConvertRequest, FxService};
