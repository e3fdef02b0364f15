//! Single-flight request coalescing.
//!
//! When many callers miss the in-process tier for the same key at once (a
//! cold cache hit right after a service restart, or a burst of requests for
//! a newly-listed symbol), only one of them should reach the next tier or
//! upstream provider; the rest wait on that one caller's result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use cache_core::error::{FabricError, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument};

type ResultMsg<V> = std::result::Result<Arc<V>, FabricError>;

/// Coalesces concurrent populate calls for the same key into one in-flight
/// call.
#[derive(Debug)]
pub struct SingleFlight<V> {
    inflight: Mutex<HashMap<String, broadcast::Sender<ResultMsg<V>>>>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> SingleFlight<V> {
    /// Creates an empty coalescing registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `populate` for `key`, or waits on an already in-flight call for
    /// the same key rather than running a second one.
    ///
    /// Returns `true` in the second element of the pair if this call was the
    /// one that actually ran `populate` (useful for hit/miss/coalesced
    /// accounting upstream).
    #[instrument(skip(self, populate), fields(key = %key))]
    pub async fn run<F, Fut>(&self, key: &str, populate: F) -> Result<(Arc<V>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut receiver = {
            let mut inflight = self.inflight.lock().await;
            if let Some(sender) = inflight.get(key) {
                Some(sender.subscribe())
            } else {
                let (sender, _) = broadcast::channel(1);
                inflight.insert(key.to_string(), sender);
                None
            }
        };

        if let Some(receiver) = receiver.take() {
            debug!("coalescing onto in-flight populate");
            return wait_for_result(receiver).await.map(|v| (v, false));
        }

        let outcome = populate().await;

        let mut inflight = self.inflight.lock().await;
        if let Some(sender) = inflight.remove(key) {
            let msg: ResultMsg<V> = match &outcome {
                Ok(value) => Ok(Arc::new(value.clone())),
                Err(e) => Err(e.clone()),
            };
            let _ = sender.send(msg);
        }
        drop(inflight);

        outcome.map(|v| (Arc::new(v), true))
    }
}

async fn wait_for_result<V>(mut receiver: broadcast::Receiver<ResultMsg<V>>) -> Result<Arc<V>> {
    match receiver.recv().await {
        Ok(Ok(value)) => Ok(value),
        // Deliver the populator's actual error kind to every coalesced
        // waiter, per §4.2.2 ("a failure is delivered as-is") and §7's
        // propagation policy — not collapsed to `Internal`, so a `NotFound`
        // or `UpstreamUnavailable` maps to the same HTTP status for every
        // waiter as it would for the lead caller.
        Ok(Err(err)) => Err(err),
        Err(_) => Err(FabricError::Internal(
            "in-flight populate sender dropped without a result".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_coalesce_onto_one_populate() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("ohlcv:AAPL:2024-01-01:2024-01-31", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42u64)
                    })
                    .await
            }));
        }

        let mut ran_populate_count = 0;
        for handle in handles {
            let (value, ran_populate) = handle.await.unwrap().unwrap();
            assert_eq!(*value, 42);
            if ran_populate {
                ran_populate_count += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ran_populate_count, 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let flight: SingleFlight<u64> = SingleFlight::new();
        let (a, a_ran) = flight.run("a", || async { Ok(1) }).await.unwrap();
        let (b, b_ran) = flight.run("b", || async { Ok(2) }).await.unwrap();
        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
        assert!(a_ran && b_ran);
    }

    #[tokio::test]
    async fn populate_errors_propagate_to_waiters() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let first = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(FabricError::UpstreamUnavailable("boom".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("k", || async { Ok(0u64) }).await })
        };

        let first_err = first.await.unwrap().unwrap_err();
        let second_err = second.await.unwrap().unwrap_err();
        assert!(matches!(first_err, FabricError::UpstreamUnavailable(_)));
        assert!(matches!(second_err, FabricError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn coalesced_waiters_see_the_populator_s_exact_error_kind() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(FabricError::NotFound("insufficient bars for AAPL".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("k", || async { Ok(0u64) }).await })
        };

        // Both the lead populator and the coalesced waiter must observe the
        // same error *kind*, so an HTTP edge mapping `NotFound` to 404 is
        // consistent across every caller on the key, not just the leader.
        assert!(matches!(
            leader.await.unwrap().unwrap_err(),
            FabricError::NotFound(_)
        ));
        assert!(matches!(
            waiter.await.unwrap().unwrap_err(),
            FabricError::NotFound(_)
        ));
    }
}
