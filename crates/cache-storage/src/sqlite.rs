//! Embedded, single-file storage backend built on `rusqlite`.
//!
//! Every query runs inside [`tokio::task::spawn_blocking`]: `rusqlite`'s
//! `Connection` is synchronous, and blocking the async runtime's worker
//! threads on disk I/O would stall every other task sharing the executor.

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
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

fn storage_err(e: impl std::fmt::Display) -> FabricError {
    FabricError::StorageUnavailable(e.to_string())
}

/// Embedded single-file (or in-memory) storage backend.
///
/// The connection is guarded by a `std::sync::Mutex` and only ever touched
/// from within `spawn_blocking`; callers never block the async runtime.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Opens (creating if missing) a SQLite database file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or schema creation fails.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let conn = tokio::task::spawn_blocking(move || Connection::open(path))
            .await
            .map_err(storage_err)?
            .map_err(storage_err)?;
        Self::from_connection(conn).await
    }

    /// Opens an in-memory database. Data does not survive past the backend
    /// being dropped; useful for tests and the embedded "no persistence"
    /// deployment mode.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.initialize_schema().await?;
        Ok(backend)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS symbols (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    symbol TEXT NOT NULL UNIQUE,
                    name TEXT,
                    currency TEXT NOT NULL,
                    exchange TEXT,
                    isin TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS bars (
                    symbol_id INTEGER NOT NULL REFERENCES symbols(id),
                    date TEXT NOT NULL,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume REAL NOT NULL,
                    adjusted_close REAL NOT NULL,
                    split_ratio REAL NOT NULL,
                    dividend REAL NOT NULL,
                    currency TEXT NOT NULL,
                    data_source TEXT NOT NULL,
                    PRIMARY KEY (symbol_id, date)
                );

                CREATE TABLE IF NOT EXISTS fundamentals (
                    symbol_id INTEGER NOT NULL REFERENCES symbols(id),
                    metric_type TEXT NOT NULL,
                    period_ending TEXT NOT NULL,
                    value REAL NOT NULL,
                    currency TEXT,
                    reported_at TEXT NOT NULL,
                    data_source TEXT NOT NULL,
                    PRIMARY KEY (symbol_id, metric_type, period_ending)
                );

                CREATE TABLE IF NOT EXISTS indicators (
                    symbol_id INTEGER NOT NULL REFERENCES symbols(id),
                    indicator_type TEXT NOT NULL,
                    date TEXT NOT NULL,
                    parameter_fingerprint TEXT NOT NULL,
                    parameters_json TEXT NOT NULL,
                    value REAL,
                    value_json TEXT,
                    PRIMARY KEY (symbol_id, indicator_type, date, parameter_fingerprint)
                );

                CREATE TABLE IF NOT EXISTS fx_rates (
                    from_currency TEXT NOT NULL,
                    to_currency TEXT NOT NULL,
                    rate REAL NOT NULL,
                    source_rate REAL NOT NULL,
                    expires_at TEXT NOT NULL,
                    data_source TEXT NOT NULL,
                    PRIMARY KEY (from_currency, to_currency)
                );

                CREATE TABLE IF NOT EXISTS fx_rate_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    from_currency TEXT NOT NULL,
                    to_currency TEXT NOT NULL,
                    rate REAL NOT NULL,
                    source_rate REAL NOT NULL,
                    observed_at TEXT NOT NULL,
                    data_source TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_fx_rate_history_pair
                    ON fx_rate_history(from_currency, to_currency, observed_at);

                CREATE TABLE IF NOT EXISTS cache_metadata (
                    cache_key TEXT PRIMARY KEY,
                    data_type TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    access_count INTEGER NOT NULL,
                    last_accessed TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_bars_symbol_date ON bars(symbol_id, date);
                CREATE INDEX IF NOT EXISTS idx_fundamentals_symbol ON fundamentals(symbol_id, metric_type);
                CREATE INDEX IF NOT EXISTS idx_indicators_symbol ON indicators(symbol_id, indicator_type, date);
                CREATE INDEX IF NOT EXISTS idx_cache_metadata_expires ON cache_metadata(expires_at);
                ",
            )
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;

        debug!("sqlite storage schema initialized");
        Ok(())
    }

    fn data_type_to_str(dt: DataType) -> &'static str {
        dt.key_class()
    }

    fn str_to_data_type(s: &str) -> DataType {
        match s {
            "ohlcv" => DataType::Ohlcv,
            "indicators" => DataType::Indicator,
            "fundamentals" => DataType::Fundamental,
            "fx" => DataType::Fx,
            "analyze" => DataType::Analysis,
            _ => DataType::Unknown,
        }
    }

    async fn resolve_symbol_id(&self, symbol: &Symbol) -> Result<Option<i64>> {
        let conn = self.conn.clone();
        let symbol = symbol.as_str().to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.query_row(
                "SELECT id FROM symbols WHERE symbol = ?1",
                params![symbol],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>> {
        let conn = self.conn.clone();
        let symbol_str = symbol.as_str().to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.query_row(
                "SELECT id, symbol, name, currency, exchange, isin, created_at, updated_at
                 FROM symbols WHERE symbol = ?1",
                params![symbol_str],
                |row| {
                    Ok(SymbolRecord {
                        id: row.get(0)?,
                        symbol: Symbol::new(row.get::<_, String>(1)?),
                        name: row.get(2)?,
                        currency: row.get(3)?,
                        exchange: row.get(4)?,
                        isin: row.get(5)?,
                        created_at: parse_ts(row.get::<_, String>(6)?)?,
                        updated_at: parse_ts(row.get::<_, String>(7)?)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self, metadata), fields(symbol = %symbol))]
    async fn upsert_symbol(&self, symbol: &Symbol, metadata: &SymbolMetadata) -> Result<SymbolRecord> {
        let conn = self.conn.clone();
        let symbol_str = symbol.as_str().to_owned();
        let metadata = metadata.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let now = Utc::now().to_rfc3339();
            let currency = metadata.currency.clone().unwrap_or_else(|| "USD".to_string());
            conn.execute(
                "INSERT INTO symbols (symbol, name, currency, exchange, isin, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(symbol) DO UPDATE SET
                    name = excluded.name,
                    currency = excluded.currency,
                    exchange = excluded.exchange,
                    isin = excluded.isin,
                    updated_at = excluded.updated_at",
                params![symbol_str, metadata.name, currency, metadata.exchange, metadata.isin, now],
            )
            .map_err(storage_err)?;

            conn.query_row(
                "SELECT id, symbol, name, currency, exchange, isin, created_at, updated_at
                 FROM symbols WHERE symbol = ?1",
                params![symbol_str],
                |row| {
                    Ok(SymbolRecord {
                        id: row.get(0)?,
                        symbol: Symbol::new(row.get::<_, String>(1)?),
                        name: row.get(2)?,
                        currency: row.get(3)?,
                        exchange: row.get(4)?,
                        isin: row.get(5)?,
                        created_at: parse_ts(row.get::<_, String>(6)?)?,
                        updated_at: parse_ts(row.get::<_, String>(7)?)?,
                    })
                },
            )
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self, update), fields(symbol = %symbol))]
    async fn update_symbol(&self, symbol: &Symbol, update: &SymbolUpdate) -> Result<SymbolRecord> {
        let existing = self
            .get_symbol(symbol)
            .await?
            .ok_or_else(|| FabricError::NotFound(format!("symbol {symbol} is not registered")))?;

        let conn = self.conn.clone();
        let symbol_str = symbol.as_str().to_owned();
        let update = update.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE symbols SET
                    name = COALESCE(?2, name),
                    currency = COALESCE(?3, currency),
                    exchange = COALESCE(?4, exchange),
                    isin = COALESCE(?5, isin),
                    updated_at = ?6
                 WHERE symbol = ?1",
                params![symbol_str, update.name, update.currency, update.exchange, update.isin, now],
            )
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;

        self.get_symbol(symbol).await?.ok_or_else(|| {
            FabricError::Internal(format!("symbol {existing:?} vanished during update"))
        })
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn get_bars(&self, symbol: &Symbol, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let Some(symbol_id) = self.resolve_symbol_id(symbol).await? else {
            return Ok(Vec::new());
        };
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT date, open, high, low, close, volume, adjusted_close, split_ratio,
                            dividend, currency, data_source
                     FROM bars WHERE symbol_id = ?1 AND date >= ?2 AND date <= ?3
                     ORDER BY date ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![symbol_id, start.to_string(), end.to_string()], row_to_bar)
                .map_err(storage_err)?;
            let mut bars = Vec::new();
            for row in rows {
                bars.push(row.map_err(storage_err)?);
            }
            Ok(bars)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn last_bar(&self, symbol: &Symbol, as_of: NaiveDate) -> Result<Option<Bar>> {
        let Some(symbol_id) = self.resolve_symbol_id(symbol).await? else {
            return Ok(None);
        };
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.query_row(
                "SELECT date, open, high, low, close, volume, adjusted_close, split_ratio,
                        dividend, currency, data_source
                 FROM bars WHERE symbol_id = ?1 AND date <= ?2
                 ORDER BY date DESC LIMIT 1",
                params![symbol_id, as_of.to_string()],
                row_to_bar,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self, bars), fields(symbol = %symbol, count = bars.len()))]
    async fn upsert_bars(&self, symbol: &Symbol, bars: &[Bar]) -> Result<()> {
        let record = self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let conn = self.conn.clone();
        let bars = bars.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let tx = conn.transaction().map_err(storage_err)?;
            for bar in &bars {
                tx.execute(
                    "INSERT INTO bars (symbol_id, date, open, high, low, close, volume,
                                       adjusted_close, split_ratio, dividend, currency, data_source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(symbol_id, date) DO UPDATE SET
                        open = excluded.open, high = excluded.high, low = excluded.low,
                        close = excluded.close, volume = excluded.volume,
                        adjusted_close = excluded.adjusted_close, split_ratio = excluded.split_ratio,
                        dividend = excluded.dividend, currency = excluded.currency,
                        data_source = excluded.data_source",
                    params![
                        record.id,
                        bar.date.to_string(),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.adjusted_close,
                        bar.split_ratio,
                        bar.dividend,
                        bar.currency,
                        bar.data_source,
                    ],
                )
                .map_err(storage_err)?;
            }
            tx.commit().map_err(storage_err)?;
            debug!("upserted {} bars", bars.len());
            Ok(())
        })
        .await
        .map_err(storage_err)?
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
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT metric_type, period_ending, value, currency, reported_at, data_source
                     FROM fundamentals
                     WHERE symbol_id = ?1 AND period_ending >= ?2 AND period_ending <= ?3
                     ORDER BY period_ending DESC, metric_type ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    params![symbol_id, start.to_string(), end.to_string()],
                    row_to_fundamental,
                )
                .map_err(storage_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage_err)?);
            }
            Ok(out)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self, values), fields(symbol = %symbol, count = values.len()))]
    async fn upsert_fundamentals(&self, symbol: &Symbol, values: &[Fundamental]) -> Result<()> {
        let record = self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let conn = self.conn.clone();
        let values = values.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let tx = conn.transaction().map_err(storage_err)?;
            for value in &values {
                tx.execute(
                    "INSERT INTO fundamentals (symbol_id, metric_type, period_ending, value,
                                                currency, reported_at, data_source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(symbol_id, metric_type, period_ending) DO UPDATE SET
                        value = excluded.value, currency = excluded.currency,
                        reported_at = excluded.reported_at, data_source = excluded.data_source",
                    params![
                        record.id,
                        value.metric_type,
                        value.period_ending.to_string(),
                        value.value,
                        value.currency,
                        value.reported_at.to_string(),
                        value.data_source,
                    ],
                )
                .map_err(storage_err)?;
            }
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?
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
        let conn = self.conn.clone();
        let indicator_type = indicator_type.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT date, parameters_json, value, value_json FROM indicators
                     WHERE symbol_id = ?1 AND indicator_type = ?2 AND parameter_fingerprint = ?3
                       AND date >= ?4 AND date <= ?5
                     ORDER BY date DESC, indicator_type ASC",
                )
                .map_err(storage_err)?;
            let indicator_type_for_rows = indicator_type.clone();
            let rows = stmt
                .query_map(
                    params![
                        symbol_id,
                        indicator_type,
                        fingerprint,
                        start.to_string(),
                        end.to_string()
                    ],
                    move |row| row_to_indicator(row, &indicator_type_for_rows),
                )
                .map_err(storage_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage_err)?);
            }
            Ok(out)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self, values), fields(symbol = %symbol, indicator_type = %indicator_type, count = values.len()))]
    async fn upsert_indicators(
        &self,
        symbol: &Symbol,
        indicator_type: &str,
        values: &[IndicatorValue],
    ) -> Result<()> {
        let record = self.upsert_symbol(symbol, &SymbolMetadata::default()).await?;
        let conn = self.conn.clone();
        let indicator_type = indicator_type.to_owned();
        let values = values.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let tx = conn.transaction().map_err(storage_err)?;
            for value in &values {
                let fingerprint = cache_core::fingerprint::parameter_fingerprint(&value.parameters);
                let parameters_json =
                    serde_json::to_string(&value.parameters).map_err(storage_err)?;
                let value_json = value
                    .value_json
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(storage_err)?;
                tx.execute(
                    "INSERT INTO indicators (symbol_id, indicator_type, date, parameter_fingerprint,
                                              parameters_json, value, value_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(symbol_id, indicator_type, date, parameter_fingerprint) DO UPDATE SET
                        value = excluded.value, value_json = excluded.value_json",
                    params![
                        record.id,
                        indicator_type,
                        value.date.to_string(),
                        fingerprint,
                        parameters_json,
                        value.value,
                        value_json,
                    ],
                )
                .map_err(storage_err)?;
            }
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self))]
    async fn get_fx_rate(&self, from: &str, to: &str) -> Result<Option<FxRate>> {
        let raw = self.get_fx_rate_raw(from, to).await?;
        Ok(raw.filter(|rate| rate.expires_at > Utc::now()))
    }

    #[instrument(skip(self))]
    async fn get_fx_rate_raw(&self, from: &str, to: &str) -> Result<Option<FxRate>> {
        let conn = self.conn.clone();
        let from = from.to_owned();
        let to = to.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.query_row(
                "SELECT from_currency, to_currency, rate, source_rate, expires_at, data_source
                 FROM fx_rates WHERE from_currency = ?1 AND to_currency = ?2",
                params![from, to],
                row_to_fx_rate,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self, rate))]
    async fn upsert_fx_rate(&self, rate: &FxRate) -> Result<()> {
        let conn = self.conn.clone();
        let rate = rate.clone();
        let now = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let tx = conn.transaction().map_err(storage_err)?;
            tx.execute(
                "INSERT INTO fx_rates (from_currency, to_currency, rate, source_rate, expires_at, data_source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(from_currency, to_currency) DO UPDATE SET
                    rate = excluded.rate, source_rate = excluded.source_rate,
                    expires_at = excluded.expires_at, data_source = excluded.data_source",
                params![
                    rate.from_currency,
                    rate.to_currency,
                    rate.rate,
                    rate.source_rate,
                    rate.expires_at.to_rfc3339(),
                    rate.data_source,
                ],
            )
            .map_err(storage_err)?;
            tx.execute(
                "INSERT INTO fx_rate_history (from_currency, to_currency, rate, source_rate, observed_at, data_source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rate.from_currency,
                    rate.to_currency,
                    rate.rate,
                    rate.source_rate,
                    now,
                    rate.data_source,
                ],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
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
        let conn = self.conn.clone();
        let from = from.to_owned();
        let to = to.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT from_currency, to_currency, rate, source_rate, observed_at, data_source
                     FROM fx_rate_history
                     WHERE from_currency = ?1 AND to_currency = ?2 AND observed_at >= ?3 AND observed_at <= ?4
                     ORDER BY observed_at ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    params![from, to, start.to_rfc3339(), end.to_rfc3339()],
                    |row| {
                        Ok(FxRate {
                            from_currency: row.get(0)?,
                            to_currency: row.get(1)?,
                            rate: row.get(2)?,
                            source_rate: row.get(3)?,
                            expires_at: parse_ts(row.get(4)?)?,
                            data_source: row.get(5)?,
                        })
                    },
                )
                .map_err(storage_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage_err)?);
            }
            Ok(out)
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self))]
    async fn is_cache_valid(&self, cache_key: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let cache_key = cache_key.to_owned();
        let expires_at: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.query_row(
                "SELECT expires_at FROM cache_metadata WHERE cache_key = ?1",
                params![cache_key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;

        Ok(match expires_at {
            Some(ts) => parse_ts(ts)? > Utc::now(),
            None => false,
        })
    }

    #[instrument(skip(self))]
    async fn touch_cache(&self, cache_key: &str, data_type: DataType, ttl: Duration) -> Result<()> {
        let conn = self.conn.clone();
        let cache_key = cache_key.to_owned();
        let data_type_str = Self::data_type_to_str(data_type);
        let now = Utc::now();
        let expires_at = (now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()))
            .to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.execute(
                "INSERT INTO cache_metadata (cache_key, data_type, expires_at, access_count, last_accessed)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    expires_at = excluded.expires_at,
                    access_count = access_count + 1,
                    last_accessed = excluded.last_accessed",
                params![cache_key, data_type_str, expires_at, now.to_rfc3339()],
            )
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reap_expired_cache(&self) -> Result<u64> {
        let conn = self.conn.clone();
        let now = Utc::now().to_rfc3339();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.execute(
                "DELETE FROM cache_metadata WHERE expires_at <= ?1",
                params![now],
            )
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
        if deleted > 0 {
            debug!("reaped {deleted} expired cache metadata entries");
        }
        Ok(deleted as u64)
    }

    #[instrument(skip(self))]
    async fn delete_cache_entry(&self, cache_key: &str) -> Result<()> {
        let conn = self.conn.clone();
        let cache_key = cache_key.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.execute(
                "DELETE FROM cache_metadata WHERE cache_key = ?1",
                params![cache_key],
            )
            .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_cache_metadata(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.execute("DELETE FROM cache_metadata", [])
                .map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<CacheStats> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            let now = Utc::now().to_rfc3339();
            let live: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM cache_metadata WHERE expires_at > ?1",
                    params![now],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            let expired: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM cache_metadata WHERE expires_at <= ?1",
                    params![now],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            let bars: i64 = conn
                .query_row("SELECT COUNT(*) FROM bars", [], |row| row.get(0))
                .map_err(storage_err)?;
            let fundamentals: i64 = conn
                .query_row("SELECT COUNT(*) FROM fundamentals", [], |row| row.get(0))
                .map_err(storage_err)?;
            let indicators: i64 = conn
                .query_row("SELECT COUNT(*) FROM indicators", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(CacheStats {
                live_entries: live as u64,
                expired_entries: expired as u64,
                bar_rows: bars as u64,
                fundamental_rows: fundamentals as u64,
                indicator_rows: indicators as u64,
            })
        })
        .await
        .map_err(storage_err)?
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| storage_err(e.to_string()))?;
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }
}

fn parse_ts(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn row_to_bar(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bar> {
    Ok(Bar {
        date: NaiveDate::parse_from_str(&row.get::<_, String>(0)?, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: row.get(5)?,
        adjusted_close: row.get(6)?,
        split_ratio: row.get(7)?,
        dividend: row.get(8)?,
        currency: row.get(9)?,
        data_source: row.get(10)?,
    })
}

fn row_to_fundamental(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fundamental> {
    Ok(Fundamental {
        metric_type: row.get(0)?,
        period_ending: NaiveDate::parse_from_str(&row.get::<_, String>(1)?, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::InvalidColumnType(1, e.to_string(), rusqlite::types::Type::Text))?,
        value: row.get(2)?,
        currency: row.get(3)?,
        reported_at: NaiveDate::parse_from_str(&row.get::<_, String>(4)?, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::InvalidColumnType(4, e.to_string(), rusqlite::types::Type::Text))?,
        data_source: row.get(5)?,
    })
}

fn row_to_indicator(row: &rusqlite::Row<'_>, indicator_type: &str) -> rusqlite::Result<IndicatorValue> {
    let parameters_json: String = row.get(1)?;
    let parameters: IndicatorParameters = serde_json::from_str(&parameters_json)
        .map_err(|e| rusqlite::Error::InvalidColumnType(1, e.to_string(), rusqlite::types::Type::Text))?;
    let value_json: Option<String> = row.get(3)?;
    let value_json = value_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::InvalidColumnType(3, e.to_string(), rusqlite::types::Type::Text))?;
    Ok(IndicatorValue {
        indicator_type: indicator_type.to_string(),
        date: NaiveDate::parse_from_str(&row.get::<_, String>(0)?, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        parameters,
        value: row.get(2)?,
        value_json,
    })
}

fn row_to_fx_rate(row: &rusqlite::Row<'_>) -> rusqlite::Result<FxRate> {
    Ok(FxRate {
        from_currency: row.get(0)?,
        to_currency: row.get(1)?,
        rate: row.get(2)?,
        source_rate: row.get(3)?,
        expires_at: parse_ts(row.get(4)?)?,
        data_source: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn symbol_round_trip() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let symbol = Symbol::new("AAPL");
        assert!(backend.get_symbol(&symbol).await.unwrap().is_none());

        let metadata = SymbolMetadata {
            name: Some("Apple Inc.".into()),
            currency: Some("USD".into()),
            exchange: Some("NASDAQ".into()),
            isin: None,
        };
        let record = backend.upsert_symbol(&symbol, &metadata).await.unwrap();
        assert_eq!(record.symbol.as_str(), "AAPL");
        assert_eq!(record.name.as_deref(), Some("Apple Inc."));
    }

    #[tokio::test]
    async fn bars_upsert_is_idempotent_on_conflict() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let symbol = Symbol::new("MSFT");
        let bar = Bar {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: 100.0,
            high: 105.0,
            low: 99.0,
            close: 104.0,
            volume: 1_000_000.0,
            adjusted_close: 104.0,
            split_ratio: 1.0,
            dividend: 0.0,
            currency: "USD".into(),
            data_source: "test".into(),
        };
        backend.upsert_bars(&symbol, &[bar.clone()]).await.unwrap();

        let mut updated = bar;
        updated.close = 106.0;
        backend.upsert_bars(&symbol, &[updated]).await.unwrap();

        let bars = backend
            .get_bars(
                &symbol,
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 106.0);
    }

    #[tokio::test]
    async fn cache_metadata_reaps_only_expired_entries() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .touch_cache("ohlcv:AAPL:2024-01-01:2024-01-31", DataType::Ohlcv, Duration::from_secs(900))
            .await
            .unwrap();
        backend
            .touch_cache("ohlcv:MSFT:2024-01-01:2024-01-31", DataType::Ohlcv, Duration::ZERO)
            .await
            .unwrap();

        assert!(backend.is_cache_valid("ohlcv:AAPL:2024-01-01:2024-01-31").await.unwrap());
        assert!(!backend.is_cache_valid("ohlcv:MSFT:2024-01-01:2024-01-31").await.unwrap());

        let reaped = backend.reap_expired_cache().await.unwrap();
        assert_eq!(reaped, 1);
        assert!(backend.is_cache_valid("ohlcv:AAPL:2024-01-01:2024-01-31").await.unwrap());
    }

    #[tokio::test]
    async fn fx_rate_round_trip() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let rate = FxRate {
            from_currency: "EUR".into(),
            to_currency: "USD".into(),
            rate: 1.08,
            source_rate: 1.08,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            data_source: "provider-a".into(),
        };
        backend.upsert_fx_rate(&rate).await.unwrap();
        let fetched = backend.get_fx_rate("EUR", "USD").await.unwrap().unwrap();
        assert_eq!(fetched.rate, 1.08);
    }
}
