use crate::error::IngestError;
use crate::market::{Asset, Exchange, TimeFrame};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV bar in canonical form, independent of which wire format it
/// arrived in. Identified by [`CandleKey`]; everything else is overwritten
/// on re-delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: Exchange,
    pub asset: Asset,
    pub time_frame: TimeFrame,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_asset_volume: Decimal,
    pub trades: Option<i64>,
    pub taker_buy_base_asset_volume: Option<Decimal>,
    pub taker_buy_quote_asset_volume: Option<Decimal>,
}

/// Natural key of a candle series row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub exchange: Exchange,
    pub asset: Asset,
    pub time_frame: TimeFrame,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            exchange: self.exchange,
            asset: self.asset,
            time_frame: self.time_frame,
            open_time: self.open_time,
            close_time: self.close_time,
        }
    }

    /// Parse one row of the monthly kline CSV layout (open time, OHLC,
    /// volume, close time, quote volume, trades, taker base, taker quote,
    /// optionally a trailing ignore column).
    pub fn from_csv_kline(
        exchange: Exchange,
        asset: Asset,
        time_frame: TimeFrame,
        line: &str,
    ) -> Result<Candle, IngestError> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 11 {
            return Err(IngestError::MalformedRecord(format!(
                "kline csv row has {} fields, expected at least 11",
                fields.len()
            )));
        }

        let open_time = parse_epoch_ms_str(fields[0], "open time")?;
        let close_time = parse_epoch_ms_str(fields[6], "close time")?;
        ensure_window(open_time, close_time)?;

        Ok(Candle {
            exchange,
            asset,
            time_frame,
            open_time,
            close_time,
            open: parse_decimal(fields[1], "open")?,
            high: parse_decimal(fields[2], "high")?,
            low: parse_decimal(fields[3], "low")?,
            close: parse_decimal(fields[4], "close")?,
            volume: parse_decimal(fields[5], "volume")?,
            quote_asset_volume: parse_decimal(fields[7], "quote asset volume")?,
            trades: Some(parse_i64(fields[8], "trades")?),
            taker_buy_base_asset_volume: Some(parse_decimal(fields[9], "taker buy base volume")?),
            taker_buy_quote_asset_volume: Some(parse_decimal(fields[10], "taker buy quote volume")?),
        })
    }
}

/// Per-candle return against the previous close in the same series.
/// Both values are None when no previous close was available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub exchange: Exchange,
    pub asset: Asset,
    pub time_frame: TimeFrame,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub return_to_last_candle: Option<Decimal>,
    pub return_to_last_candle_pct: Option<Decimal>,
}

impl DerivedMetric {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            exchange: self.exchange,
            asset: self.asset,
            time_frame: self.time_frame,
            open_time: self.open_time,
            close_time: self.close_time,
        }
    }
}

/// Last observed close of a series, owned by exactly one task and never
/// persisted. A fresh task starts empty, so the first metric it produces
/// carries no return values.
#[derive(Debug, Clone, Default)]
pub struct CarryState {
    last: Option<(DateTime<Utc>, Decimal)>,
}

impl CarryState {
    /// Compute the derived metric for `candle` against the carried close,
    /// then move the carry forward. Re-deliveries of a still-open candle
    /// share its close time and leave the carry untouched, so every
    /// re-delivery is measured against the same previous candle.
    pub fn observe(&mut self, candle: &Candle) -> DerivedMetric {
        let (ret, pct) = match self.last {
            Some((_, last_close)) => {
                let diff = candle.close - last_close;
                let pct = if last_close.is_zero() {
                    None
                } else {
                    Some(diff / last_close)
                };
                (Some(diff), pct)
            }
            None => (None, None),
        };

        let tied = matches!(self.last, Some((close_time, _)) if close_time == candle.close_time);
        if !tied {
            self.last = Some((candle.close_time, candle.close));
        }

        DerivedMetric {
            exchange: candle.exchange,
            asset: candle.asset,
            time_frame: candle.time_frame,
            open_time: candle.open_time,
            close_time: candle.close_time,
            return_to_last_candle: ret,
            return_to_last_candle_pct: pct,
        }
    }
}

pub(crate) fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, IngestError> {
    raw.trim().parse::<Decimal>().map_err(|_| {
        IngestError::MalformedRecord(format!("{field} is not numeric: '{raw}'"))
    })
}

pub(crate) fn parse_i64(raw: &str, field: &str) -> Result<i64, IngestError> {
    raw.trim().parse::<i64>().map_err(|_| {
        IngestError::MalformedRecord(format!("{field} is not an integer: '{raw}'"))
    })
}

pub(crate) fn parse_epoch_ms(ms: i64, field: &str) -> Result<DateTime<Utc>, IngestError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        IngestError::MalformedRecord(format!("{field} is out of range: {ms}"))
    })
}

pub(crate) fn parse_epoch_ms_str(raw: &str, field: &str) -> Result<DateTime<Utc>, IngestError> {
    parse_epoch_ms(parse_i64(raw, field)?, field)
}

/// Close time for a venue whose wire format carries only the open time.
pub(crate) fn close_time_from(
    open_time: DateTime<Utc>,
    window: Duration,
) -> Result<DateTime<Utc>, IngestError> {
    open_time.checked_add_signed(window).ok_or_else(|| {
        IngestError::MalformedRecord(format!(
            "candle window starting {open_time} overflows the supported time range"
        ))
    })
}

pub(crate) fn ensure_window(
    open_time: DateTime<Utc>,
    close_time: DateTime<Utc>,
) -> Result<(), IngestError> {
    if open_time < close_time {
        Ok(())
    } else {
        Err(IngestError::MalformedRecord(format!(
            "open time {open_time} is not before close time {close_time}"
        )))
    }
}
