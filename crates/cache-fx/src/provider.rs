//! FX rate providers.
//!
//! Shaped after `data_yahoo::YahooProvider`: a thin `reqwest::Client`
//! wrapper, a typed response struct per provider, and a bounded per-request
//! timeout so a slow upstream surfaces as [`FabricError::UpstreamTimeout`]
//! rather than hanging the caller.

use std::time::Duration;

use async_trait::async_trait;
use cache_core::error::{FabricError, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Default per-request timeout for FX provider fetches.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// A source of FX rates, queried in declared failover order by
/// [`crate::service::FxService`].
#[async_trait]
pub trait FxRateProvider: Send + Sync + std::fmt::Debug {
    /// Human-readable identifier recorded as `FxRate::data_source`.
    fn name(&self) -> &str;

    /// Fetches the current rate such that `amount_in_to = amount_in_from * rate`.
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64>;
}

/// Provider A: a keyed pair-endpoint provider (`/pair/{from}/{to}`).
#[derive(Debug)]
pub struct ProviderA {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct PairResponse {
    rate: f64,
}

impl ProviderA {
    /// Creates a provider against `base_url` authenticating with `api_key`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl FxRateProvider for ProviderA {
    fn name(&self) -> &str {
        "provider-a"
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64> {
        let url = format!("{}/pair/{from}/{to}", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let parsed: PairResponse = response
            .error_for_status()
            .map_err(map_reqwest_err)?
            .json()
            .await
            .map_err(map_reqwest_err)?;

        debug!(rate = parsed.rate, "fetched rate from provider-a");
        Ok(parsed.rate)
    }
}

/// Provider B: a keyless base+symbol endpoint (`/latest?base=X&symbols=Y`).
#[derive(Debug)]
pub struct ProviderB {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    rates: std::collections::HashMap<String, f64>,
}

impl ProviderB {
    /// Creates a provider against `base_url`. No API key is required.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl FxRateProvider for ProviderB {
    fn name(&self) -> &str {
        "provider-b"
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64> {
        let url = format!("{}/latest", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("base", from), ("symbols", to)])
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let parsed: LatestResponse = response
            .error_for_status()
            .map_err(map_reqwest_err)?
            .json()
            .await
            .map_err(map_reqwest_err)?;

        parsed.rates.get(to).copied().ok_or_else(|| {
            FabricError::UpstreamUnavailable(format!("provider-b response missing rate for {to}"))
        })
    }
}

/// Provider C: a keyed base+symbol endpoint, the last-resort failover.
#[derive(Debug)]
pub struct ProviderC {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ProviderC {
    /// Creates a provider against `base_url` authenticating with `api_key`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl FxRateProvider for ProviderC {
    fn name(&self) -> &str {
        "provider-c"
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64> {
        let url = format!("{}/convert", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("access_key", self.api_key.as_str()), ("from", from), ("to", to)])
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let parsed: PairResponse = response
            .error_for_status()
            .map_err(map_reqwest_err)?
            .json()
            .await
            .map_err(map_reqwest_err)?;

        warn!("fell through to last-resort fx provider");
        Ok(parsed.rate)
    }
}

fn map_reqwest_err(e: reqwest::Error) -> FabricError {
    if e.is_timeout() {
        FabricError::UpstreamTimeout(DEFAULT_FETCH_TIMEOUT, e.to_string())
    } else {
        FabricError::UpstreamUnavailable(e.to_string())
    }
}
