use crate::database::repository::CandleRepository;
use crate::error::IngestError;
use crate::model::{Candle, CandleKey, DerivedMetric};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    candles: HashMap<CandleKey, Candle>,
    derived: HashMap<CandleKey, DerivedMetric>,
    candle_calls: usize,
    derived_calls: usize,
    fail_budget: usize,
}

/// Map-backed repository with the same overwrite-by-natural-key semantics
/// as the Postgres implementation. Used by `backfill --dry-run` and by the
/// pipeline tests, which also use the injectable failure budget.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` upsert calls fail with a transient
    /// persistence error before touching any row.
    pub fn fail_next_upserts(&self, calls: usize) {
        self.inner.lock().fail_budget = calls;
    }

    /// Number of `upsert_candles` calls seen, failed attempts included.
    pub fn candle_calls(&self) -> usize {
        self.inner.lock().candle_calls
    }

    pub fn derived_calls(&self) -> usize {
        self.inner.lock().derived_calls
    }

    pub fn candle_count(&self) -> usize {
        self.inner.lock().candles.len()
    }

    pub fn derived_count(&self) -> usize {
        self.inner.lock().derived.len()
    }

    pub fn candle(&self, key: &CandleKey) -> Option<Candle> {
        self.inner.lock().candles.get(key).cloned()
    }

    pub fn derived_metric(&self, key: &CandleKey) -> Option<DerivedMetric> {
        self.inner.lock().derived.get(key).cloned()
    }
}

#[async_trait]
impl CandleRepository for MemoryRepository {
    async fn init_tables(&self) -> Result<(), IngestError> {
        Ok(())
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> Result<(), IngestError> {
        let mut inner = self.inner.lock();
        inner.candle_calls += 1;
        if inner.fail_budget > 0 {
            inner.fail_budget -= 1;
            return Err(IngestError::Persistence("injected store failure".into()));
        }
        for candle in candles {
            inner.candles.insert(candle.key(), candle.clone());
        }
        Ok(())
    }

    async fn upsert_derived(&self, metrics: &[DerivedMetric]) -> Result<(), IngestError> {
        let mut inner = self.inner.lock();
        inner.derived_calls += 1;
        if inner.fail_budget > 0 {
            inner.fail_budget -= 1;
            return Err(IngestError::Persistence("injected store failure".into()));
        }
        for metric in metrics {
            inner.derived.insert(metric.key(), metric.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Asset, Exchange, TimeFrame};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candle(asset: Asset, open_hour: u32, close: rust_decimal::Decimal) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2024, 1, 1, open_hour, 0, 0).unwrap();
        Candle {
            exchange: Exchange::Binance,
            asset,
            time_frame: TimeFrame::H1,
            open_time,
            close_time: open_time + Duration::hours(1),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            quote_asset_volume: dec!(1),
            trades: None,
            taker_buy_base_asset_volume: None,
            taker_buy_quote_asset_volume: None,
        }
    }

    #[tokio::test]
    async fn second_write_wins_under_the_same_key() {
        let repo = MemoryRepository::new();
        let first = candle(Asset::BtcUsdt, 0, dec!(100));
        let mut second = first.clone();
        second.close = dec!(105);

        repo.upsert_candles(&[first.clone()]).await.unwrap();
        repo.upsert_candles(&[second.clone()]).await.unwrap();

        assert_eq!(repo.candle_count(), 1);
        assert_eq!(repo.candle(&first.key()).unwrap().close, dec!(105));
    }

    #[tokio::test]
    async fn distinct_keys_stay_disjoint() {
        let repo = MemoryRepository::new();
        repo.upsert_candles(&[
            candle(Asset::BtcUsdt, 0, dec!(100)),
            candle(Asset::BtcUsdt, 1, dec!(101)),
            candle(Asset::EthUsdt, 0, dec!(50)),
        ])
        .await
        .unwrap();

        assert_eq!(repo.candle_count(), 3);
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_rows() {
        let repo = MemoryRepository::new();
        repo.fail_next_upserts(1);

        let batch = [
            candle(Asset::BtcUsdt, 0, dec!(100)),
            candle(Asset::BtcUsdt, 1, dec!(101)),
        ];
        let result = repo.upsert_candles(&batch).await;

        assert!(matches!(result, Err(IngestError::Persistence(_))));
        assert_eq!(repo.candle_count(), 0);

        // The budget is exhausted; the retried batch lands whole.
        repo.upsert_candles(&batch).await.unwrap();
        assert_eq!(repo.candle_count(), 2);
        assert_eq!(repo.candle_calls(), 2);
    }
}
