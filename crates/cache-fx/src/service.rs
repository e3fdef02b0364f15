//! [`FxService`]: rate acquisition, conversion, and history.
//!
//! Implements the acquisition order exactly: same-currency shortcut, direct
//! cache lookup, unconditional inversion lookup, then provider failover
//! A -> B -> C short-circuiting on first success.

use std::sync::Arc;
use std::time::Duration;

use cache_core::error::{FabricError, Result};
use cache_core::types::FxRate;
use cache_storage::StorageBackend;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::provider::FxRateProvider;

/// Time-to-live applied to freshly fetched rates.
const FX_TTL: Duration = Duration::from_secs(60 * 60);

/// One request in a [`FxService::batch_convert`] call.
#[derive(Clone, Debug)]
pub struct ConvertRequest {
    /// Source currency.
    pub from: String,
    /// Target currency.
    pub to: String,
    /// Amount denominated in `from`.
    pub amount: f64,
}

/// The outcome of one [`ConvertRequest`] within a batch.
#[derive(Clone, Debug)]
pub struct ConvertOutcome {
    /// Echoes the request this outcome answers.
    pub request: ConvertRequest,
    /// `Ok(converted_amount)` or `Err(message)`.
    pub result: std::result::Result<f64, String>,
}

/// Rate acquisition, conversion, and history over a [`StorageBackend`] and a
/// failover chain of [`FxRateProvider`]s.
#[derive(Debug)]
pub struct FxService {
    storage: Arc<dyn StorageBackend>,
    providers: Vec<Arc<dyn FxRateProvider>>,
}

impl FxService {
    /// Creates a service backed by `storage`, querying `providers` in the
    /// given order on a cache miss.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, providers: Vec<Arc<dyn FxRateProvider>>) -> Self {
        Self { storage, providers }
    }

    /// Returns the rate such that `amount_in_to = amount_in_from * rate`.
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn get_rate(&self, from: &str, to: &str) -> Result<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(1.0);
        }
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();

        if let Some(direct) = self.storage.get_fx_rate(&from, &to).await? {
            return Ok(direct.rate);
        }

        if let Some(inverse) = self.storage.get_fx_rate_raw(&to, &from).await? {
            if inverse.expires_at > Utc::now() {
                return Ok(1.0 / inverse.rate);
            }
        }

        self.fetch_and_store(&from, &to).await
    }

    /// Converts `amount` from `from` to `to`.
    #[instrument(skip(self), fields(from = %from, to = %to, amount))]
    pub async fn convert(&self, from: &str, to: &str, amount: f64) -> Result<f64> {
        let rate = self.get_rate(from, to).await?;
        Ok(amount * rate)
    }

    /// Converts every request independently; one failure does not abort the
    /// batch.
    pub async fn batch_convert(&self, requests: &[ConvertRequest]) -> Vec<ConvertOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self
                .convert(&request.from, &request.to, request.amount)
                .await
                .map_err(|e| e.to_string());
            outcomes.push(ConvertOutcome {
                request: request.clone(),
                result,
            });
        }
        outcomes
    }

    /// Returns every stored rate observation for `(from, to)` within
    /// `[start, end]`, ordered ascending.
    pub async fn rate_history(
        &self,
        from: &str,
        to: &str,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> Result<Vec<FxRate>> {
        self.storage
            .get_fx_rate_history(&from.to_ascii_uppercase(), &to.to_ascii_uppercase(), start, end)
            .await
    }

    /// Arithmetic mean of `rate` over the history window, or `None` if the
    /// window contains no observations.
    pub async fn average_rate(
        &self,
        from: &str,
        to: &str,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let rows = self.rate_history(from, to, start, end).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let sum: f64 = rows.iter().map(|r| r.rate).sum();
        Ok(Some(sum / rows.len() as f64))
    }

    async fn fetch_and_store(&self, from: &str, to: &str) -> Result<f64> {
        for provider in &self.providers {
            match provider.fetch_rate(from, to).await {
                Ok(rate) => {
                    let record = FxRate {
                        from_currency: from.to_string(),
                        to_currency: to.to_string(),
                        rate,
                        source_rate: rate,
                        expires_at: Utc::now() + FX_TTL,
                        data_source: provider.name().to_string(),
                    };
                    self.storage.upsert_fx_rate(&record).await?;
                    return Ok(rate);
                }
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "fx provider failed, trying next");
                }
            }
        }
        Err(FabricError::FxUnavailable {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cache_storage::InMemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct AlwaysFails;

    #[async_trait]
    impl FxRateProvider for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }
        async fn fetch_rate(&self, _from: &str, _to: &str) -> Result<f64> {
            Err(FabricError::UpstreamUnavailable("nope".into()))
        }
    }

    #[derive(Debug)]
    struct CountingProvider {
        calls: AtomicUsize,
        rate: f64,
    }

    #[async_trait]
    impl FxRateProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        async fn fetch_rate(&self, _from: &str, _to: &str) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rate)
        }
    }

    #[tokio::test]
    async fn same_currency_is_always_one() {
        let storage = Arc::new(InMemoryBackend::new());
        let svc = FxService::new(storage, vec![]);
        assert_eq!(svc.get_rate("usd", "USD").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn inversion_is_used_without_calling_any_provider() {
        let storage = Arc::new(InMemoryBackend::new());
        storage
            .upsert_fx_rate(&FxRate {
                from_currency: "USD".into(),
                to_currency: "EUR".into(),
                rate: 0.8,
                source_rate: 0.8,
                expires_at: Utc::now() + Duration::from_secs(3600),
                data_source: "seed".into(),
            })
            .await
            .unwrap();

        let counting = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            rate: 999.0,
        });
        let svc = FxService::new(storage, vec![counting.clone()]);

        let rate = svc.get_rate("EUR", "USD").await.unwrap();
        assert!((rate - 1.25).abs() < 1e-9);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_providers_failing_surfaces_fx_unavailable() {
        let storage = Arc::new(InMemoryBackend::new());
        let svc = FxService::new(storage, vec![Arc::new(AlwaysFails), Arc::new(AlwaysFails)]);
        let err = svc.get_rate("USD", "JPY").await.unwrap_err();
        assert!(matches!(err, FabricError::FxUnavailable { .. }));
    }

    #[tokio::test]
    async fn failover_short_circuits_on_first_success() {
        let storage = Arc::new(InMemoryBackend::new());
        let counting = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            rate: 1.5,
        });
        let svc = FxService::new(
            storage,
            vec![Arc::new(AlwaysFails), counting.clone(), Arc::new(AlwaysFails)],
        );
        let rate = svc.get_rate("USD", "GBP").await.unwrap();
        assert_eq!(rate, 1.5);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_convert_reports_per_request_failures() {
        let storage = Arc::new(InMemoryBackend::new());
        let svc = FxService::new(storage, vec![Arc::new(AlwaysFails)]);
        let requests = vec![
            ConvertRequest {
                from: "USD".into(),
                to: "USD".into(),
                amount: 10.0,
            },
            ConvertRequest {
                from: "USD".into(),
                to: "JPY".into(),
                amount: 10.0,
            },
        ];
        let outcomes = svc.batch_convert(&requests).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result, Ok(10.0));
        assert!(outcomes[1].result.is_err());
    }

    #[tokio::test]
    async fn average_rate_is_none_for_empty_window() {
        let storage = Arc::new(InMemoryBackend::new());
        let svc = FxService::new(storage, vec![]);
        let now = Utc::now();
        let avg = svc
            .average_rate("USD", "EUR", now - Duration::from_secs(3600), now)
            .await
            .unwrap();
        assert_eq!(avg, None);
    }
}
