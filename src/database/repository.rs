use crate::error::IngestError;
use crate::model::{Candle, DerivedMetric};
use async_trait::async_trait;

/// Persistence boundary for the ingestion paths. Implementations key rows
/// by (exchange, symbol, interval, open_time, close_time) and treat each
/// call as one atomic batch: either every row lands or none do.
#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Create tables and indexes if they do not exist yet.
    async fn init_tables(&self) -> Result<(), IngestError>;

    /// Insert the batch, overwriting rows that already exist under the
    /// same natural key. The second write wins.
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<(), IngestError>;

    /// Same contract for the per-candle return rows.
    async fn upsert_derived(&self, metrics: &[DerivedMetric]) -> Result<(), IngestError>;
}
