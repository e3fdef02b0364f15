//! In-memory storage backend.
//!
//! Backs tests and the "no persistence" deployment mode: every entity table
//! is a `HashMap` guarded by a single `tokio::sync::RwLock`. Data does not
//! survive past the backend being dropped.

use async_trait::async_trait;
use cache_core::{
    error::{FabricError, Result},
    storage::{CacheStats, StorageBackend},
    types::{
        Bar, CacheMetadataEntry, DataType, Fundamental, FxRate, IndicatorParameters,
        IndicatorValue, Symbol, SymbolMetadata, SymbolRecord, SymbolUpdate,
    },
};
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::instrument;

#[derive(Debug, Default)]
struct State {
    symbols: HashMap<String, SymbolRecord>,
    next_symbol_id: i64,
    bars: HashMap<String, HashMap<NaiveDate, Bar>>,
    fundamentals: HashMap<String, HashMap<(String, NaiveDate), Fundamental>>,
    indicators: HashMap<String, HashMap<(String, NaiveDate, String), IndicatorValue>>,
    fx_rates: HashMap<(String, String), FxRate>,
    fx_rate_history: HashMap<(String, String), Vec<(chrono::DateTime<Utc>, FxRate)>>,
    cache_metadata: HashMap<String, CacheMetadataEntry>,
}

/// In-memory implementation of [`StorageBackend`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: RwLock<State>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>> {
        Ok(self.state.read().await.symbols.get(symbol.as_str()).cloned())
    }

    #[instrument(skip(self, metadata), fields(symbol = %symbol))]
    async fn upsert_symbol(&self, symbol: &Symbol, metadata: &SymbolMetadata) -> Result<SymbolRecord> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let currency = metadata.currency.clone().unwrap_or_else(|| "USD".to_string());
        if let Some(existing) = state.symbols.get(symbol.as_str()).cloned() {
            let record = SymbolRecord {
                name: metadata.name.clone().or(existing.name),
                currency,
                exchange: metadata.exchange.clone().or(existing.exchange),
                isin: metadata.isin.clone().or(existing.isin),
                updated_at: now,
                ..existing
            };
            state.symbols.insert(symbol.as_str().to_string(), record.clone());
            Ok(record)
        } else {
            state.next_symbol_id += 1;
            let record = SymbolRecord {
                id: state.next_symbol_id,
                symbol: symbol.clone(),
                name: metadata.name.clone(),
                currency,
                exchange: metadata.exchange.clone(),
                isin: metadata.isin.clone(),
                created_at: now,
                updated_at: now,
            };
            state.symbols.insert(symbol.as_str().to_string(), record.clone());
            Ok(record)
        }
    }

    #[instrument(skip(self, update), fields(symbol = %symbol))]
    async fn update_symbol(&self, symbol: &Symbol, update: &SymbolUpdate) -> Result<SymbolRecord> {
        let mut state = self.state.write().await;
        let existing = state
            .symbols
            .get(symbol.as_str())
            .cloned()
            .ok_or_else(|| FabricError::NotFound(format!("symbol {symbol} is not registered")))?;
        let record = SymbolRecord {
            name: update.name.clone().or(existing.name),
            currency: update.currency.clone().unwrap_or(existing.currency),
            exchange: update.exchange.clone().or(existing.exchange),
            isin: update.isin.clone().or(existing.isin),
            updated_at: Utc::now(),
            ..existing
        };
        state.symbols.insert(symbol.as_str().to_string(), record.clone());
        Ok(record)
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_bars(&self, symbol: &Symbol, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let state = self.state.read().await;
        let mut bars: Vec<Bar> = state
            .bars
            .get(symbol.as_str())
            .map(|by_date| {
                by_date
                    .values()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn last_bar(&self, symbol: &Symbol, as_of: NaiveDate) -> Result<Option<Bar>> {
        let state = self.state.read().await;
        Ok(state
            .bars
            .get(symbol.as_str())
            .and_then(|by_date| by_date.values().filter(|b| b.date <= as_of).max_by_key(|b| b.date))
            .cloned())
    }

    #[instrument(skip(self, bars), fields(symbol = %symbol, count = bars.len()))]
    async fn upsert_bars(&self, symbol: &Symbol, bars: &[Bar]) -> Result<()> {
        self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let mut state = self.state.write().await;
        let entry = state.bars.entry(symbol.as_str().to_string()).or_default();
        for bar in bars {
            entry.insert(bar.date, bar.clone());
        }
        Ok(())
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_fundamentals(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Fundamental>> {
        let state = self.state.read().await;
        let mut values: Vec<Fundamental> = state
            .fundamentals
            .get(symbol.as_str())
            .map(|by_key| {
                by_key
                    .values()
                    .filter(|f| f.period_ending >= start && f.period_ending <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        values.sort_by(|a, b| b.period_ending.cmp(&a.period_ending).then_with(|| a.metric_type.cmp(&b.metric_type)));
        Ok(values)
    }

    #[instrument(skip(self, values), fields(symbol = %symbol, count = values.len()))]
    async fn upsert_fundamentals(&self, symbol: &Symbol, values: &[Fundamental]) -> Result<()> {
        self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let mut state = self.state.write().await;
        let entry = state.fundamentals.entry(symbol.as_str().to_string()).or_default();
        for value in values {
            entry.insert((value.metric_type.clone(), value.period_ending), value.clone());
        }
        Ok(())
    }

    #[instrument(skip(self, parameters), fields(symbol = %symbol, indicator_type = %indicator_type))]
    async fn get_indicators(
        &self,
        symbol: &Symbol,
        indicator_type: &str,
        parameters: &IndicatorParameters,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IndicatorValue>> {
        let fingerprint = cache_core::fingerprint::parameter_fingerprint(parameters);
        let state = self.state.read().await;
        let mut values: Vec<IndicatorValue> = state
            .indicators
            .get(symbol.as_str())
            .map(|by_key| {
                by_key
                    .iter()
                    .filter(|((ind, date, fp), _)| {
                        ind == indicator_type && fp == &fingerprint && *date >= start && *date <= end
                    })
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default();
        values.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.indicator_type.cmp(&b.indicator_type)));
        Ok(values)
    }

    #[instrument(skip(self, values), fields(symbol = %symbol, indicator_type = %indicator_type, count = values.len()))]
    async fn upsert_indicators(
        &self,
        symbol: &Symbol,
        indicator_type: &str,
        values: &[IndicatorValue],
    ) -> Result<()> {
        self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let mut state = self.state.write().await;
        let entry = state.indicators.entry(symbol.as_str().to_string()).or_default();
        for value in values {
            let fingerprint = cache_core::fingerprint::parameter_fingerprint(&value.parameters);
            entry.insert(
                (indicator_type.to_string(), value.date, fingerprint),
                IndicatorValue {
                    indicator_type: indicator_type.to_string(),
                    ..value.clone()
                },
            );
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_fx_rate(&self, from: &str, to: &str) -> Result<Option<FxRate>> {
        let raw = self.get_fx_rate_raw(from, to).await?;
        Ok(raw.filter(|rate| rate.expires_at > Utc::now()))
    }

    #[instrument(skip(self))]
    async fn get_fx_rate_raw(&self, from: &str, to: &str) -> Result<Option<FxRate>> {
        let state = self.state.read().await;
        Ok(state.fx_rates.get(&(from.to_string(), to.to_string())).cloned())
    }

    #[instrument(skip(self, rate))]
    async fn upsert_fx_rate(&self, rate: &FxRate) -> Result<()> {
        let mut state = self.state.write().await;
        let pair = (rate.from_currency.clone(), rate.to_currency.clone());
        state.fx_rates.insert(pair.clone(), rate.clone());
        state
            .fx_rate_history
            .entry(pair)
            .or_default()
            .push((Utc::now(), rate.clone()));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_fx_rate_history(
        &self,
        from: &str,
        to: &str,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> Result<Vec<FxRate>> {
        let state = self.state.read().await;
        let mut rows: Vec<(chrono::DateTime<Utc>, FxRate)> = state
            .fx_rate_history
            .get(&(from.to_string(), to.to_string()))
            .map(|rows| {
                rows.iter()
                    .filter(|(observed_at, _)| *observed_at >= start && *observed_at <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|(observed_at, _)| *observed_at);
        Ok(rows.into_iter().map(|(_, rate)| rate).collect())
    }

    #[instrument(skip(self))]
    async fn is_cache_valid(&self, cache_key: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .cache_metadata
            .get(cache_key)
            .is_some_and(|entry| entry.expires_at > Utc::now()))
    }

    #[instrument(skip(self))]
    async fn touch_cache(&self, cache_key: &str, data_type: DataType, ttl: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        state
            .cache_metadata
            .entry(cache_key.to_string())
            .and_modify(|entry| {
                entry.expires_at = expires_at;
                entry.access_count += 1;
                entry.last_accessed = now;
            })
            .or_insert(CacheMetadataEntry {
                cache_key: cache_key.to_string(),
                expires_at,
                data_type,
                access_count: 1,
                last_accessed: now,
            });
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reap_expired_cache(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let before = state.cache_metadata.len();
        state.cache_metadata.retain(|_, entry| entry.expires_at > now);
        Ok((before - state.cache_metadata.len()) as u64)
    }

    #[instrument(skip(self))]
    async fn delete_cache_entry(&self, cache_key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.cache_metadata.remove(cache_key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_cache_metadata(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.cache_metadata.clear();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<CacheStats> {
        let state = self.state.read().await;
        let now = Utc::now();
        let (live, expired) = state
            .cache_metadata
            .values()
            .fold((0u64, 0u64), |(live, expired), entry| {
                if entry.expires_at > now {
                    (live + 1, expired)
                } else {
                    (live, expired + 1)
                }
            });
        Ok(CacheStats {
            live_entries: live,
            expired_entries: expired,
            bar_rows: state.bars.values().map(HashMap::len).sum::<usize>() as u64,
            fundamental_rows: state.fundamentals.values().map(HashMap::len).sum::<usize>() as u64,
            indicator_rows: state.indicators.values().map(HashMap::len).sum::<usize>() as u64,
        })
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_symbol_has_no_bars() {
        let backend = InMemoryBackend::new();
        let bars = backend
            .get_bars(
                &Symbol::new("AAPL"),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            )
            .await
            .unwrap();
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn update_unknown_symbol_is_not_found() {
        let backend = InMemoryBackend::new();
        let result = backend
            .update_symbol(&Symbol::new("AAPL"), &SymbolUpdate::default())
            .await;
        assert!(matches!(result, Err(FabricError::NotFound(_))));
    }

    #[tokio::test]
    async fn reap_only_removes_expired_entries() {
        let backend = InMemoryBackend::new();
        backend
            .touch_cache("fx:EUR:USD", DataType::Fx, Duration::from_secs(3600))
            .await
            .unwrap();
        backend
            .touch_cache("fx:GBP:USD", DataType::Fx, Duration::ZERO)
            .await
            .unwrap();
        let reaped = backend.reap_expired_cache().await.unwrap();
        assert_eq!(reaped, 1);
        assert!(backend.is_cache_valid("fx:EUR:USD").await.unwrap());
    }
}
