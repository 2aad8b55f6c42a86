use crate::error::IngestError;
use crate::exchange::{http_client, ExchangeConnector, StreamRequest};
use crate::market::Market;
use crate::model::{close_time_from, parse_decimal, parse_epoch_ms, parse_epoch_ms_str, Candle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const REST_BASE: &str = "https://api.bybit.com";
const STREAM_BASE: &str = "wss://stream.bybit.com/v5/public/spot";
const PAGE_LIMIT: u32 = 1000;

/// One row of `GET /v5/market/kline`: start time plus OHLCV and
/// turnover, all serialized as strings. Bybit serves rows newest first
/// and carries no close time, trade count, or taker split.
type RestKline = (String, String, String, String, String, String, String);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
    ret_code: i64,
    ret_msg: String,
    #[serde(default)]
    result: KlineResult,
}

#[derive(Debug, Default, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<RestKline>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    topic: Option<String>,
    #[serde(default)]
    data: Vec<StreamKline>,
    op: Option<String>,
    success: Option<bool>,
    ret_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamKline {
    start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    turnover: String,
}

#[derive(Debug)]
pub struct BybitConnector {
    client: Client,
}

impl BybitConnector {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

/// Bybit klines carry only the open time. The close time is derived
/// from the interval so rows land under the same key no matter whether
/// they arrived over REST or the stream.
fn rest_row_to_candle(market: Market, row: &RestKline) -> Result<Candle, IngestError> {
    let open_time = parse_epoch_ms_str(&row.0, "start time")?;
    let close_time = close_time_from(open_time, market.time_frame.duration())?;
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
        quote_asset_volume: parse_decimal(&row.6, "turnover")?,
        trades: None,
        taker_buy_base_asset_volume: None,
        taker_buy_quote_asset_volume: None,
    })
}

fn stream_kline_to_candle(market: Market, frame: &StreamKline) -> Result<Candle, IngestError> {
    let open_time = parse_epoch_ms(frame.start, "start time")?;
    let close_time = close_time_from(open_time, market.time_frame.duration())?;
    Ok(Candle {
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
        quote_asset_volume: parse_decimal(&frame.turnover, "turnover")?,
        trades: None,
        taker_buy_base_asset_volume: None,
        taker_buy_quote_asset_volume: None,
    })
}

fn parse_rest_body(market: Market, body: KlineResponse) -> Result<Vec<Candle>, IngestError> {
    if body.ret_code != 0 {
        return Err(IngestError::Connection(format!(
            "bybit kline request for {market} rejected: {} ({})",
            body.ret_msg, body.ret_code
        )));
    }
    // Newest row first on the wire; the pipeline wants oldest first.
    body.result
        .list
        .iter()
        .rev()
        .map(|row| rest_row_to_candle(market, row))
        .collect()
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    async fn fetch_page(
        &self,
        market: Market,
        start: DateTime<Utc>,
    ) -> Result<Vec<Candle>, IngestError> {
        let url = format!(
            "{REST_BASE}/v5/market/kline?category=spot&symbol={}&interval={}&start={}&limit={PAGE_LIMIT}",
            market.asset.symbol_upper(),
            market.time_frame.bybit_interval(),
            start.timestamp_millis(),
        );
        debug!("Requesting klines: {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(IngestError::Connection(format!(
                "bybit kline request for {market} failed with status {}",
                response.status()
            )));
        }

        let body: KlineResponse = response
            .json()
            .await
            .map_err(|e| IngestError::MalformedRecord(format!("bybit kline body: {e}")))?;
        parse_rest_body(market, body)
    }

    fn stream_request(&self, market: Market) -> StreamRequest {
        StreamRequest {
            url: STREAM_BASE.to_string(),
            subscribe: Some(
                json!({
                    "op": "subscribe",
                    "args": [format!(
                        "kline.{}.{}",
                        market.time_frame.bybit_interval(),
                        market.asset.symbol_upper()
                    )],
                })
                .to_string(),
            ),
            ping_text: Some(json!({ "op": "ping" }).to_string()),
        }
    }

    fn parse_stream_message(
        &self,
        market: Market,
        text: &str,
    ) -> Result<Vec<Candle>, IngestError> {
        let envelope: StreamEnvelope = serde_json::from_str(text)
            .map_err(|e| IngestError::MalformedRecord(format!("bybit stream frame: {e}")))?;

        // Subscription acks and pong replies carry no kline data.
        if envelope.success.is_some()
            || envelope.op.as_deref() == Some("pong")
            || envelope.ret_msg.as_deref() == Some("pong")
        {
            return Ok(Vec::new());
        }
        let Some(topic) = envelope.topic else {
            return Err(IngestError::MalformedRecord(
                "bybit stream frame carries neither a topic nor an ack".into(),
            ));
        };
        if !topic.starts_with("kline.") {
            return Ok(Vec::new());
        }

        // An interval rollover pushes the closed candle and its successor
        // in one frame; every entry is a row.
        envelope
            .data
            .iter()
            .map(|frame| stream_kline_to_candle(market, frame))
            .collect()
    }
}
