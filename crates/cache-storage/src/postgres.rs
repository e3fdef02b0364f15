//! Hosted storage backend built on `sqlx`'s Postgres driver.
//!
//! Used for the fabric's "hosted, shared" deployment mode, where multiple
//! fabric instances need a common persistent/distributed tier rather than
//! each keeping its own embedded file.

use async_trait::async_trait;
use cache_core::{
    error::{FabricError, Result},
    storage::{CacheStats, StorageBackend},
    types::{
        Bar, DataType, Fundamental, FxRate, IndicatorParameters, IndicatorValue, Symbol,
        SymbolMetadata, SymbolRecord, SymbolUpdate,
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use tracing::{debug, instrument};

fn storage_err(e: impl std::fmt::Display) -> FabricError {
    FabricError::StorageUnavailable(e.to_string())
}

/// Hosted storage backend backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connects to `database_url` and ensures the schema exists.
    ///
    /// # Errors
    /// Returns an error if the pool cannot connect or schema creation fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(storage_err)?;

        let backend = Self { pool };
        backend.initialize_schema().await?;
        Ok(backend)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS symbols (
                id BIGSERIAL PRIMARY KEY,
                symbol TEXT NOT NULL UNIQUE,
                name TEXT,
                currency TEXT NOT NULL,
                exchange TEXT,
                isin TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bars (
                symbol_id BIGINT NOT NULL REFERENCES symbols(id),
                date DATE NOT NULL,
                open DOUBLE PRECISION NOT NULL,
                high DOUBLE PRECISION NOT NULL,
                low DOUBLE PRECISION NOT NULL,
                close DOUBLE PRECISION NOT NULL,
                volume DOUBLE PRECISION NOT NULL,
                adjusted_close DOUBLE PRECISION NOT NULL,
                split_ratio DOUBLE PRECISION NOT NULL,
                dividend DOUBLE PRECISION NOT NULL,
                currency TEXT NOT NULL,
                data_source TEXT NOT NULL,
                PRIMARY KEY (symbol_id, date)
            );

            CREATE TABLE IF NOT EXISTS fundamentals (
                symbol_id BIGINT NOT NULL REFERENCES symbols(id),
                metric_type TEXT NOT NULL,
                period_ending DATE NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                currency TEXT,
                reported_at DATE NOT NULL,
                data_source TEXT NOT NULL,
                PRIMARY KEY (symbol_id, metric_type, period_ending)
            );

            CREATE TABLE IF NOT EXISTS indicators (
                symbol_id BIGINT NOT NULL REFERENCES symbols(id),
                indicator_type TEXT NOT NULL,
                date DATE NOT NULL,
                parameter_fingerprint TEXT NOT NULL,
                parameters_json JSONB NOT NULL,
                value DOUBLE PRECISION,
                value_json JSONB,
                PRIMARY KEY (symbol_id, indicator_type, date, parameter_fingerprint)
            );

            CREATE TABLE IF NOT EXISTS fx_rates (
                from_currency TEXT NOT NULL,
                to_currency TEXT NOT NULL,
                rate DOUBLE PRECISION NOT NULL,
                source_rate DOUBLE PRECISION NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                data_source TEXT NOT NULL,
                PRIMARY KEY (from_currency, to_currency)
            );

            CREATE TABLE IF NOT EXISTS fx_rate_history (
                id BIGSERIAL PRIMARY KEY,
                from_currency TEXT NOT NULL,
                to_currency TEXT NOT NULL,
                rate DOUBLE PRECISION NOT NULL,
                source_rate DOUBLE PRECISION NOT NULL,
                observed_at TIMESTAMPTZ NOT NULL,
                data_source TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fx_rate_history_pair
                ON fx_rate_history(from_currency, to_currency, observed_at);

            CREATE TABLE IF NOT EXISTS cache_metadata (
                cache_key TEXT PRIMARY KEY,
                data_type TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                access_count BIGINT NOT NULL,
                last_accessed TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_bars_symbol_date ON bars(symbol_id, date);
            CREATE INDEX IF NOT EXISTS idx_cache_metadata_expires ON cache_metadata(expires_at);
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!("postgres storage schema initialized");
        Ok(())
    }

    async fn resolve_symbol_id(&self, symbol: &Symbol) -> Result<Option<i64>> {
        sqlx::query("SELECT id FROM symbols WHERE symbol = $1")
            .bind(symbol.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)
            .map(|row| row.map(|r| r.get::<i64, _>(0)))
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>> {
        let row = sqlx::query(
            "SELECT id, symbol, name, currency, exchange, isin, created_at, updated_at
             FROM symbols WHERE symbol = $1",
        )
        .bind(symbol.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|row| SymbolRecord {
            id: row.get(0),
            symbol: Symbol::new(row.get::<String, _>(1)),
            name: row.get(2),
            currency: row.get(3),
            exchange: row.get(4),
            isin: row.get(5),
            created_at: row.get(6),
            updated_at: row.get(7),
        }))
    }

    #[instrument(skip(self, metadata), fields(symbol = %symbol))]
    async fn upsert_symbol(&self, symbol: &Symbol, metadata: &SymbolMetadata) -> Result<SymbolRecord> {
        let now = Utc::now();
        let currency = metadata.currency.clone().unwrap_or_else(|| "USD".to_string());
        sqlx::query(
            "INSERT INTO symbols (symbol, name, currency, exchange, isin, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             ON CONFLICT (symbol) DO UPDATE SET
                name = excluded.name, currency = excluded.currency,
                exchange = excluded.exchange, isin = excluded.isin, updated_at = excluded.updated_at",
        )
        .bind(symbol.as_str())
        .bind(&metadata.name)
        .bind(&currency)
        .bind(&metadata.exchange)
        .bind(&metadata.isin)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.get_symbol(symbol)
            .await?
            .ok_or_else(|| FabricError::Internal(format!("symbol {symbol} vanished after upsert")))
    }

    #[instrument(skip(self, update), fields(symbol = %symbol))]
    async fn update_symbol(&self, symbol: &Symbol, update: &SymbolUpdate) -> Result<SymbolRecord> {
        self.get_symbol(symbol)
            .await?
            .ok_or_else(|| FabricError::NotFound(format!("symbol {symbol} is not registered")))?;

        sqlx::query(
            "UPDATE symbols SET
                name = COALESCE($2, name), currency = COALESCE($3, currency),
                exchange = COALESCE($4, exchange), isin = COALESCE($5, isin), updated_at = $6
             WHERE symbol = $1",
        )
        .bind(symbol.as_str())
        .bind(&update.name)
        .bind(&update.currency)
        .bind(&update.exchange)
        .bind(&update.isin)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.get_symbol(symbol)
            .await?
            .ok_or_else(|| FabricError::Internal(format!("symbol {symbol} vanished during update")))
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_bars(&self, symbol: &Symbol, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let Some(symbol_id) = self.resolve_symbol_id(symbol).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT date, open, high, low, close, volume, adjusted_close, split_ratio,
                    dividend, currency, data_source
             FROM bars WHERE symbol_id = $1 AND date >= $2 AND date <= $3 ORDER BY date ASC",
        )
        .bind(symbol_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(pg_row_to_bar).collect())
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn last_bar(&self, symbol: &Symbol, as_of: NaiveDate) -> Result<Option<Bar>> {
        let Some(symbol_id) = self.resolve_symbol_id(symbol).await? else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT date, open, high, low, close, volume, adjusted_close, split_ratio,
                    dividend, currency, data_source
             FROM bars WHERE symbol_id = $1 AND date <= $2 ORDER BY date DESC LIMIT 1",
        )
        .bind(symbol_id)
        .bind(as_of)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(pg_row_to_bar))
    }

    #[instrument(skip(self, bars), fields(symbol = %symbol, count = bars.len()))]
    async fn upsert_bars(&self, symbol: &Symbol, bars: &[Bar]) -> Result<()> {
        let record = self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for bar in bars {
            sqlx::query(
                "INSERT INTO bars (symbol_id, date, open, high, low, close, volume,
                                   adjusted_close, split_ratio, dividend, currency, data_source)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (symbol_id, date) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume,
                    adjusted_close = excluded.adjusted_close, split_ratio = excluded.split_ratio,
                    dividend = excluded.dividend, currency = excluded.currency,
                    data_source = excluded.data_source",
            )
            .bind(record.id)
            .bind(bar.date)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(bar.adjusted_close)
            .bind(bar.split_ratio)
            .bind(bar.dividend)
            .bind(&bar.currency)
            .bind(&bar.data_source)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        debug!("upserted {} bars", bars.len());
        Ok(())
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_fundamentals(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Fundamental>> {
        let Some(symbol_id) = self.resolve_symbol_id(symbol).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT metric_type, period_ending, value, currency, reported_at, data_source
             FROM fundamentals
             WHERE symbol_id = $1 AND period_ending >= $2 AND period_ending <= $3
             ORDER BY period_ending DESC, metric_type ASC",
        )
        .bind(symbol_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|row| Fundamental {
                metric_type: row.get(0),
                period_ending: row.get(1),
                value: row.get(2),
                currency: row.get(3),
                reported_at: row.get(4),
                data_source: row.get(5),
            })
            .collect())
    }

    #[instrument(skip(self, values), fields(symbol = %symbol, count = values.len()))]
    async fn upsert_fundamentals(&self, symbol: &Symbol, values: &[Fundamental]) -> Result<()> {
        let record = self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for value in values {
            sqlx::query(
                "INSERT INTO fundamentals (symbol_id, metric_type, period_ending, value,
                                            currency, reported_at, data_source)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (symbol_id, metric_type, period_ending) DO UPDATE SET
                    value = excluded.value, currency = excluded.currency,
                    reported_at = excluded.reported_at, data_source = excluded.data_source",
            )
            .bind(record.id)
            .bind(&value.metric_type)
            .bind(value.period_ending)
            .bind(value.value)
            .bind(&value.currency)
            .bind(value.reported_at)
            .bind(&value.data_source)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
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
        let Some(symbol_id) = self.resolve_symbol_id(symbol).await? else {
            return Ok(Vec::new());
        };
        let fingerprint = cache_core::fingerprint::parameter_fingerprint(parameters);
        let rows = sqlx::query(
            "SELECT date, parameters_json, value, value_json FROM indicators
             WHERE symbol_id = $1 AND indicator_type = $2 AND parameter_fingerprint = $3
               AND date >= $4 AND date <= $5
             ORDER BY date DESC, indicator_type ASC",
        )
        .bind(symbol_id)
        .bind(indicator_type)
        .bind(&fingerprint)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter()
            .map(|row| {
                let parameters_json: serde_json::Value = row.get(1);
                let parameters: IndicatorParameters =
                    serde_json::from_value(parameters_json).map_err(storage_err)?;
                Ok(IndicatorValue {
                    indicator_type: indicator_type.to_string(),
                    date: row.get(0),
                    parameters,
                    value: row.get(2),
                    value_json: row.get(3),
                })
            })
            .collect()
    }

    #[instrument(skip(self, values), fields(symbol = %symbol, indicator_type = %indicator_type, count = values.len()))]
    async fn upsert_indicators(
        &self,
        symbol: &Symbol,
        indicator_type: &str,
        values: &[IndicatorValue],
    ) -> Result<()> {
        let record = self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for value in values {
            let fingerprint = cache_core::fingerprint::parameter_fingerprint(&value.parameters);
            let parameters_json = serde_json::to_value(&value.parameters).map_err(storage_err)?;
            sqlx::query(
                "INSERT INTO indicators (symbol_id, indicator_type, date, parameter_fingerprint,
                                          parameters_json, value, value_json)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (symbol_id, indicator_type, date, parameter_fingerprint) DO UPDATE SET
                    value = excluded.value, value_json = excluded.value_json",
            )
            .bind(record.id)
            .bind(indicator_type)
            .bind(value.date)
            .bind(&fingerprint)
            .bind(&parameters_json)
            .bind(value.value)
            .bind(&value.value_json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_fx_rate(&self, from: &str, to: &str) -> Result<Option<FxRate>> {
        let raw = self.get_fx_rate_raw(from, to).await?;
        Ok(raw.filter(|rate| rate.expires_at > Utc::now()))
    }

    #[instrument(skip(self))]
    async fn get_fx_rate_raw(&self, from: &str, to: &str) -> Result<Option<FxRate>> {
        let row = sqlx::query(
            "SELECT from_currency, to_currency, rate, source_rate, expires_at, data_source
             FROM fx_rates WHERE from_currency = $1 AND to_currency = $2",
        )
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|row| FxRate {
            from_currency: row.get(0),
            to_currency: row.get(1),
            rate: row.get(2),
            source_rate: row.get(3),
            expires_at: row.get(4),
            data_source: row.get(5),
        }))
    }

    #[instrument(skip(self, rate))]
    async fn upsert_fx_rate(&self, rate: &FxRate) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query(
            "INSERT INTO fx_rates (from_currency, to_currency, rate, source_rate, expires_at, data_source)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (from_currency, to_currency) DO UPDATE SET
                rate = excluded.rate, source_rate = excluded.source_rate,
                expires_at = excluded.expires_at, data_source = excluded.data_source",
        )
        .bind(&rate.from_currency)
        .bind(&rate.to_currency)
        .bind(rate.rate)
        .bind(rate.source_rate)
        .bind(rate.expires_at)
        .bind(&rate.data_source)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO fx_rate_history (from_currency, to_currency, rate, source_rate, observed_at, data_source)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&rate.from_currency)
        .bind(&rate.to_currency)
        .bind(rate.rate)
        .bind(rate.source_rate)
        .bind(Utc::now())
        .bind(&rate.data_source)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_fx_rate_history(
        &self,
        from: &str,
        to: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FxRate>> {
        let rows = sqlx::query(
            "SELECT from_currency, to_currency, rate, source_rate, observed_at, data_source
             FROM fx_rate_history
             WHERE from_currency = $1 AND to_currency = $2 AND observed_at >= $3 AND observed_at <= $4
             ORDER BY observed_at ASC",
        )
        .bind(from)
        .bind(to)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|row| FxRate {
                from_currency: row.get(0),
                to_currency: row.get(1),
                rate: row.get(2),
                source_rate: row.get(3),
                expires_at: row.get(4),
                data_source: row.get(5),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn is_cache_valid(&self, cache_key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT expires_at FROM cache_metadata WHERE cache_key = $1")
            .bind(cache_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(match row {
            Some(row) => {
                let expires_at: DateTime<Utc> = row.get(0);
                expires_at > Utc::now()
            }
            None => false,
        })
    }

    #[instrument(skip(self))]
    async fn touch_cache(&self, cache_key: &str, data_type: DataType, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        sqlx::query(
            "INSERT INTO cache_metadata (cache_key, data_type, expires_at, access_count, last_accessed)
             VALUES ($1, $2, $3, 1, $4)
             ON CONFLICT (cache_key) DO UPDATE SET
                expires_at = excluded.expires_at,
                access_count = cache_metadata.access_count + 1,
                last_accessed = excluded.last_accessed",
        )
        .bind(cache_key)
        .bind(data_type.key_class())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reap_expired_cache(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_metadata WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!("reaped {deleted} expired cache metadata entries");
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn delete_cache_entry(&self, cache_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_metadata WHERE cache_key = $1")
            .bind(cache_key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_cache_metadata(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_metadata")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<CacheStats> {
        let now = Utc::now();
        let live: i64 = sqlx::query("SELECT COUNT(*) FROM cache_metadata WHERE expires_at > $1")
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .get(0);
        let expired: i64 = sqlx::query("SELECT COUNT(*) FROM cache_metadata WHERE expires_at <= $1")
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .get(0);
        let bars: i64 = sqlx::query("SELECT COUNT(*) FROM bars")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .get(0);
        let fundamentals: i64 = sqlx::query("SELECT COUNT(*) FROM fundamentals")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .get(0);
        let indicators: i64 = sqlx::query("SELECT COUNT(*) FROM indicators")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .get(0);

        Ok(CacheStats {
            live_entries: live as u64,
            expired_entries: expired as u64,
            bar_rows: bars as u64,
            fundamental_rows: fundamentals as u64,
            indicator_rows: indicators as u64,
        })
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn pg_row_to_bar(row: sqlx::postgres::PgRow) -> Bar {
    Bar {
        date: row.get(0),
        open: row.get(1),
        high: row.get(2),
        low: row.get(3),
        close: row.get(4),
        volume: row.get(5),
        adjusted_close: row.get(6),
        split_ratio: row.get(7),
        dividend: row.get(8),
        currency: row.get(9),
        data_source: row.get(10),
    }
}
