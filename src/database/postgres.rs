use crate::config::DatabaseSettings;
use crate::database::repository::CandleRepository;
use crate::error::IngestError;
use crate::model::{Candle, DerivedMetric};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, IngestError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url())
            .await
            .map_err(|e| {
                IngestError::Configuration(format!(
                    "could not open database pool to {}:{}/{}: {e}",
                    settings.host, settings.port, settings.name
                ))
            })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl CandleRepository for PostgresRepository {
    // Create tables if they don't exist
    async fn init_tables(&self) -> Result<(), IngestError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS candles (
                id SERIAL PRIMARY KEY,
                exchange VARCHAR NOT NULL,
                symbol VARCHAR NOT NULL,
                interval VARCHAR NOT NULL,
                open_time TIMESTAMPTZ NOT NULL,
                close_time TIMESTAMPTZ NOT NULL,
                open_price NUMERIC NOT NULL,
                high_price NUMERIC NOT NULL,
                low_price NUMERIC NOT NULL,
                close_price NUMERIC NOT NULL,
                volume NUMERIC NOT NULL,
                quote_asset_volume NUMERIC NOT NULL,
                number_of_trades BIGINT,
                taker_buy_base_volume NUMERIC,
                taker_buy_quote_volume NUMERIC,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (exchange, symbol, interval, open_time, close_time)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("create candles table", e))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS candle_returns (
                id SERIAL PRIMARY KEY,
                exchange VARCHAR NOT NULL,
                symbol VARCHAR NOT NULL,
                interval VARCHAR NOT NULL,
                open_time TIMESTAMPTZ NOT NULL,
                close_time TIMESTAMPTZ NOT NULL,
                return_to_last_candle NUMERIC,
                return_to_last_candle_pct NUMERIC,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (exchange, symbol, interval, open_time, close_time)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("create candle_returns table", e))?;

        // Indices for the common series scans
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candles_symbol_interval ON candles(symbol, interval)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("create candles index", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candles_open_time ON candles(open_time DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("create candles time index", e))?;

        info!("Database tables initialized successfully");
        Ok(())
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> Result<(), IngestError> {
        if candles.is_empty() {
            return Ok(());
        }

        // One transaction per batch; the first failed row rolls the whole
        // batch back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error("begin candle batch", e))?;

        for candle in candles {
            sqlx::query(
                "INSERT INTO candles
                (exchange, symbol, interval, open_time, close_time,
                 open_price, high_price, low_price, close_price, volume,
                 quote_asset_volume, number_of_trades, taker_buy_base_volume, taker_buy_quote_volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (exchange, symbol, interval, open_time, close_time)
                DO UPDATE SET
                    open_price = EXCLUDED.open_price,
                    high_price = EXCLUDED.high_price,
                    low_price = EXCLUDED.low_price,
                    close_price = EXCLUDED.close_price,
                    volume = EXCLUDED.volume,
                    quote_asset_volume = EXCLUDED.quote_asset_volume,
                    number_of_trades = EXCLUDED.number_of_trades,
                    taker_buy_base_volume = EXCLUDED.taker_buy_base_volume,
                    taker_buy_quote_volume = EXCLUDED.taker_buy_quote_volume",
            )
            .bind(candle.exchange.as_str())
            .bind(candle.asset.symbol())
            .bind(candle.time_frame.as_str())
            .bind(candle.open_time)
            .bind(candle.close_time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.quote_asset_volume)
            .bind(candle.trades)
            .bind(candle.taker_buy_base_asset_volume)
            .bind(candle.taker_buy_quote_asset_volume)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("upsert candle", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx_error("commit candle batch", e))?;

        Ok(())
    }

    async fn upsert_derived(&self, metrics: &[DerivedMetric]) -> Result<(), IngestError> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error("begin returns batch", e))?;

        for metric in metrics {
            sqlx::query(
                "INSERT INTO candle_returns
                (exchange, symbol, interval, open_time, close_time,
                 return_to_last_candle, return_to_last_candle_pct)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (exchange, symbol, interval, open_time, close_time)
                DO UPDATE SET
                    return_to_last_candle = EXCLUDED.return_to_last_candle,
                    return_to_last_candle_pct = EXCLUDED.return_to_last_candle_pct",
            )
            .bind(metric.exchange.as_str())
            .bind(metric.asset.symbol())
            .bind(metric.time_frame.as_str())
            .bind(metric.open_time)
            .bind(metric.close_time)
            .bind(metric.return_to_last_candle)
            .bind(metric.return_to_last_candle_pct)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("upsert candle return", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx_error("commit returns batch", e))?;

        Ok(())
    }
}

/// Split sqlx failures into retryable outages and non-retryable shape
/// mismatches. Integrity, data and undefined-object errors mean the store
/// disagrees with the code; connectivity and pool errors mean it is
/// temporarily unreachable.
fn classify_sqlx_error(context: &str, e: sqlx::Error) -> IngestError {
    match &e {
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default();
            if code.starts_with("22") || code.starts_with("23") || code.starts_with("42") {
                IngestError::Schema(format!("{context}: {e}"))
            } else {
                IngestError::Persistence(format!("{context}: {e}"))
            }
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => IngestError::Schema(format!("{context}: {e}")),
        sqlx::Error::Configuration(_) => {
            IngestError::Configuration(format!("{context}: {e}"))
        }
        _ => IngestError::Persistence(format!("{context}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_transient() {
        let classified = classify_sqlx_error("upsert candle", sqlx::Error::PoolTimedOut);
        assert!(matches!(classified, IngestError::Persistence(_)));
        assert!(classified.is_transient());

        let classified = classify_sqlx_error("upsert candle", sqlx::Error::PoolClosed);
        assert!(matches!(classified, IngestError::Persistence(_)));
    }

    #[test]
    fn shape_failures_are_not_retried() {
        let classified = classify_sqlx_error(
            "upsert candle",
            sqlx::Error::ColumnNotFound("taker_buy_base_volume".into()),
        );
        assert!(matches!(classified, IngestError::Schema(_)));
        assert!(!classified.is_transient());
    }
}
