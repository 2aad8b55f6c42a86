use crate::error::IngestError;
use crate::exchange::{http_client, ExchangeConnector, StreamRequest};
use crate::market::Market;
use crate::model::{ensure_window, parse_decimal, parse_epoch_ms, Candle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

const REST_BASE: &str = "https://api.binance.com";
const FUTURES_REST_BASE: &str = "https://fapi.binance.com";
const STREAM_BASE: &str = "wss://stream.binance.com:9443";
const PAGE_LIMIT: u32 = 1000;

/// Which Binance kline listing the backfill reads. Live streaming is
/// spot-only either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinanceKlineSource {
    #[default]
    Spot,
    /// USD-margined perpetual contract klines from the futures API.
    Perpetual,
}

/// One row of `GET /api/v3/klines`. Binance encodes rows as positional
/// JSON arrays with prices serialized as strings.
type RestKline = (
    i64,               // open time, epoch ms
    String,            // open
    String,            // high
    String,            // low
    String,            // close
    String,            // volume
    i64,               // close time, epoch ms
    String,            // quote asset volume
    i64,               // number of trades
    String,            // taker buy base asset volume
    String,            // taker buy quote asset volume
    serde_json::Value, // unused by the API
);

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "k")]
    kline: KlineFrame,
}

#[derive(Debug, Deserialize)]
struct KlineFrame {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "n")]
    trades: i64,
    #[serde(rename = "V")]
    taker_buy_base: String,
    #[serde(rename = "Q")]
    taker_buy_quote: String,
}

#[derive(Debug)]
pub struct BinanceConnector {
    client: Client,
    source: BinanceKlineSource,
}

impl BinanceConnector {
    pub fn new() -> Result<Self, IngestError> {
        Self::with_source(BinanceKlineSource::default())
    }

    pub fn with_source(source: BinanceKlineSource) -> Result<Self, IngestError> {
        Ok(Self {
            client: http_client()?,
            source,
        })
    }

    fn rest_url(&self, market: Market, start: DateTime<Utc>) -> String {
        match self.source {
            BinanceKlineSource::Spot => format!(
                "{REST_BASE}/api/v3/klines?symbol={}&interval={}&startTime={}&limit={PAGE_LIMIT}",
                market.asset.symbol_upper(),
                market.time_frame.binance_interval(),
                start.timestamp_millis(),
            ),
            BinanceKlineSource::Perpetual => format!(
                "{FUTURES_REST_BASE}/fapi/v1/continuousKlines?pair={}&contractType=PERPETUAL&interval={}&startTime={}&limit={PAGE_LIMIT}",
                market.asset.symbol_upper(),
                market.time_frame.binance_interval(),
                start.timestamp_millis(),
            ),
        }
    }
}

fn rest_row_to_candle(market: Market, row: &RestKline) -> Result<Candle, IngestError> {
    let open_time = parse_epoch_ms(row.0, "open time")?;
    let close_time = parse_epoch_ms(row.6, "close time")?;
    ensure_window(open_time, close_time)?;
    Ok(Candle {
        exchange: market.exchange,
        asset: market.asset,
        time_frame: market.time_frame,
        open_time,
        close_time,
        open: parse_decimal(&row.1, "open")?,
        high: parse_decimal(&row.2, "high")?,
        low: parse_decimal(&row.3, "low")?,
        close: parse_decimal(&row.4, "close")?,
        volume: parse_decimal(&row.5, "volume")?,
        quote_asset_volume: parse_decimal(&row.7, "quote asset volume")?,
        trades: Some(row.8),
        taker_buy_base_asset_volume: Some(parse_decimal(&row.9, "taker buy base volume")?),
        taker_buy_quote_asset_volume: Some(parse_decimal(&row.10, "taker buy quote volume")?),
    })
}

fn parse_rest_rows(market: Market, rows: &[RestKline]) -> Result<Vec<Candle>, IngestError> {
    rows.iter().map(|row| rest_row_to_candle(market, row)).collect()
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    async fn fetch_page(
        &self,
        market: Market,
        start: DateTime<Utc>,
    ) -> Result<Vec<Candle>, IngestError> {
        let url = self.rest_url(market, start);
        debug!("Requesting klines: {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(IngestError::Connection(format!(
                "binance klines request for {market} failed with status {}",
                response.status()
            )));
        }

        let rows: Vec<RestKline> = response
            .json()
            .await
            .map_err(|e| IngestError::MalformedRecord(format!("binance klines body: {e}")))?;
        parse_rest_rows(market, &rows)
    }

    fn stream_request(&self, market: Market) -> StreamRequest {
        StreamRequest {
            url: format!(
                "{STREAM_BASE}/ws/{}@kline_{}",
                market.asset.symbol(),
                market.time_frame.binance_interval()
            ),
            subscribe: None,
            ping_text: None,
        }
    }

    fn parse_stream_message(
        &self,
        market: Market,
        text: &str,
    ) -> Result<Vec<Candle>, IngestError> {
        let event: KlineEvent = serde_json::from_str(text)
            .map_err(|e| IngestError::MalformedRecord(format!("binance stream frame: {e}")))?;
        if event.event != "kline" {
            return Ok(Vec::new());
        }

        let frame = event.kline;
        let open_time = parse_epoch_ms(frame.open_time, "open time")?;
        let close_time = parse_epoch_ms(frame.close_time, "close time")?;
        ensure_window(open_time, close_time)?;
        Ok(vec![Candle {
            exchange: market.exchange,
            asset: market.asset,
            time_frame: market.time_frame,
            open_time,
            close_time,
            open: parse_decimal(&frame.open, "open")?,
            high: parse_decimal(&frame.high, "high")?,
            low: parse_decimal(&frame.low, "low")?,
            close: parse_decimal(&frame.close, "close")?,
            volume: parse_decimal(&frame.volume, "volume")?,
            quote_asset_volume: parse_decimal(&frame.quote_volume, "quote asset volume")?,
            trades: Some(frame.trades),
            taker_buy_base_asset_volume: Some(parse_decimal(
                &frame.taker_buy_base,
                "taker buy base volume",
            )?),
            taker_buy_quote_asset_volume: Some(parse_decimal(
                &frame.taker_buy_quote,
                "taker buy quote volume",
            )?),
        }])
    }
}
