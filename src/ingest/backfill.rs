use crate::database::repository::CandleRepository;
use crate::error::IngestError;
use crate::exchange::{connector_with_source, BinanceKlineSource, ExchangeConnector};
use crate::market::{Exchange, Market};
use crate::model::CarryState;
use crate::utils::{retry, RetryPolicy};
use chrono::{DateTime, Months, TimeZone, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Earliest kline date worth requesting; neither venue lists anything
/// before 2017.
fn sweep_origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn next_month(cursor: DateTime<Utc>) -> DateTime<Utc> {
    cursor
        .checked_add_months(Months::new(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Crawl one market from the fixed origin until the cursor reaches the
/// current date. The cursor follows the last close time each page
/// returns, so short pages still advance it; a month with no data is
/// skipped with a calendar step. Every page is persisted before the
/// cursor moves, so at most one page is ever in flight.
#[instrument(skip(connector, repository, policy), fields(market = %market))]
pub async fn backfill_market(
    connector: &dyn ExchangeConnector,
    repository: &dyn CandleRepository,
    policy: &RetryPolicy,
    market: Market,
) -> Result<(), IngestError> {
    let mut cursor = sweep_origin();
    let mut carry = CarryState::default();
    let mut pages = 0u64;
    let mut rows = 0u64;

    // Today is re-read every pass; a long crawl can cross midnight.
    while cursor.date_naive() < Utc::now().date_naive() {
        let page = retry(policy, "kline page fetch", || {
            connector.fetch_page(market, cursor)
        })
        .await?;

        let last_close = match page.last() {
            Some(last) => last.close_time,
            None => {
                cursor = next_month(cursor);
                continue;
            }
        };

        let metrics: Vec<_> = page.iter().map(|candle| carry.observe(candle)).collect();
        retry(policy, "candle batch upsert", || {
            repository.upsert_candles(&page)
        })
        .await?;
        retry(policy, "derived batch upsert", || {
            repository.upsert_derived(&metrics)
        })
        .await?;

        // A page that fails to move the cursor would repeat forever.
        if last_close <= cursor {
            return Err(IngestError::MalformedRecord(format!(
                "kline page for {market} did not advance past {cursor}"
            )));
        }
        pages += 1;
        rows += page.len() as u64;
        cursor = last_close;
    }

    info!("Backfill finished: {} pages, {} rows", pages, rows);
    Ok(())
}

/// One full historical sweep over the whole grid.
pub async fn run_sweep(
    repository: Arc<dyn CandleRepository>,
    policy: RetryPolicy,
    source: BinanceKlineSource,
) {
    sweep_markets(repository, policy, source, &Market::all()).await;
}

/// Sweep the given markets one cell at a time to stay inside venue rate
/// limits. A failed cell is logged and the sweep moves on to the next
/// one.
pub async fn sweep_markets(
    repository: Arc<dyn CandleRepository>,
    policy: RetryPolicy,
    source: BinanceKlineSource,
    markets: &[Market],
) {
    info!("Starting historical sweep over {} markets", markets.len());

    for exchange in Exchange::ALL {
        let connector = match connector_with_source(exchange, source) {
            Ok(connector) => connector,
            Err(e) => {
                error!("Backfill for {} skipped: {}", exchange, e);
                continue;
            }
        };
        for market in markets.iter().filter(|m| m.exchange == exchange) {
            if let Err(e) =
                backfill_market(connector.as_ref(), repository.as_ref(), &policy, *market).await
            {
                error!("Backfill for {} failed: {}", market, e);
            }
        }
    }

    info!("Historical sweep complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryRepository;
    use crate::exchange::StreamRequest;
    use crate::market::{Asset, TimeFrame};
    use crate::model::Candle;
    use async_trait::async_trait;
    use chrono::Duration;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::time::Duration as StdDuration;

    struct ScriptedConnector {
        pages: Mutex<VecDeque<Vec<Candle>>>,
        requested: Mutex<Vec<DateTime<Utc>>>,
    }

    impl ScriptedConnector {
        fn new(pages: Vec<Vec<Candle>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<DateTime<Utc>> {
            self.requested.lock().clone()
        }
    }

    #[async_trait]
    impl ExchangeConnector for ScriptedConnector {
        async fn fetch_page(
            &self,
            _market: Market,
            start: DateTime<Utc>,
        ) -> Result<Vec<Candle>, IngestError> {
            self.requested.lock().push(start);
            Ok(self.pages.lock().pop_front().unwrap_or_default())
        }

        fn stream_request(&self, _market: Market) -> StreamRequest {
            StreamRequest {
                url: String::new(),
                subscribe: None,
                ping_text: None,
            }
        }

        fn parse_stream_message(
            &self,
            _market: Market,
            _text: &str,
        ) -> Result<Vec<Candle>, IngestError> {
            Ok(Vec::new())
        }
    }

    fn market() -> Market {
        Market::new(Exchange::Binance, Asset::BtcUsdt, TimeFrame::H1)
    }

    fn candle_at(open_time: DateTime<Utc>, close: Decimal) -> Candle {
        Candle {
            exchange: Exchange::Binance,
            asset: Asset::BtcUsdt,
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

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn two_pages_then_empty_advances_by_a_calendar_month() {
        let origin = sweep_origin();
        let page1 = vec![
            candle_at(origin, dec!(100)),
            candle_at(origin + Duration::hours(1), dec!(105)),
        ];
        let page2 = vec![
            candle_at(origin + Duration::hours(2), dec!(102)),
            candle_at(origin + Duration::hours(3), dec!(110)),
        ];
        let connector = ScriptedConnector::new(vec![page1.clone(), page2.clone()]);
        let repository = MemoryRepository::new();

        backfill_market(&connector, &repository, &fast_policy(), market())
            .await
            .unwrap();

        // Two non-empty pages, one upsert pair each.
        assert_eq!(repository.candle_calls(), 2);
        assert_eq!(repository.derived_calls(), 2);
        assert_eq!(repository.candle_count(), 4);

        let requested = connector.requested();
        assert_eq!(requested[0], origin);
        assert_eq!(requested[1], page1[1].close_time);
        assert_eq!(requested[2], page2[1].close_time);
        // The empty third page advanced past the month with no data.
        assert_eq!(requested[3], next_month(page2[1].close_time));

        // One carry ran across both pages.
        let first = repository.derived_metric(&page1[0].key()).unwrap();
        assert_eq!(first.return_to_last_candle, None);
        let second = repository.derived_metric(&page1[1].key()).unwrap();
        assert_eq!(second.return_to_last_candle, Some(dec!(5)));
        assert_eq!(second.return_to_last_candle_pct, Some(dec!(0.05)));
        let third = repository.derived_metric(&page2[0].key()).unwrap();
        assert_eq!(third.return_to_last_candle, Some(dec!(-3)));
        let fourth = repository.derived_metric(&page2[1].key()).unwrap();
        assert_eq!(fourth.return_to_last_candle, Some(dec!(8)));
    }

    #[tokio::test]
    async fn empty_pages_always_move_the_cursor_forward() {
        let connector = ScriptedConnector::new(Vec::new());
        let repository = MemoryRepository::new();

        backfill_market(&connector, &repository, &fast_policy(), market())
            .await
            .unwrap();

        assert_eq!(repository.candle_calls(), 0);
        let requested = connector.requested();
        assert!(requested.len() > 24, "expected one request per empty month");
        assert!(requested.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn page_behind_the_cursor_is_rejected() {
        let stale = Utc.with_ymd_and_hms(2016, 6, 1, 0, 0, 0).unwrap();
        let connector = ScriptedConnector::new(vec![vec![candle_at(stale, dec!(90))]]);
        let repository = MemoryRepository::new();

        let err = backfill_market(&connector, &repository, &fast_policy(), market())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::MalformedRecord(_)));
        assert_eq!(connector.requested().len(), 1);
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried_within_a_page() {
        let origin = sweep_origin();
        let page = vec![
            candle_at(origin, dec!(100)),
            candle_at(origin + Duration::hours(1), dec!(101)),
        ];
        let connector = ScriptedConnector::new(vec![page]);
        let repository = MemoryRepository::new();
        repository.fail_next_upserts(1);

        backfill_market(&connector, &repository, &fast_policy(), market())
            .await
            .unwrap();

        // First candle upsert failed and was retried before the page
        // advanced; nothing was lost.
        assert_eq!(repository.candle_calls(), 2);
        assert_eq!(repository.candle_count(), 2);
        assert_eq!(repository.derived_count(), 2);
    }
}
