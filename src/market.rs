use crate::error::IngestError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchanges with ingestion support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    Bybit,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Binance, Exchange::Bybit];

    /// Stable lowercase token stored alongside every candle row.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            other => Err(IngestError::Configuration(format!(
                "unknown exchange '{other}'"
            ))),
        }
    }
}

/// Tracked trading pairs. The store keeps the lowercase symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    BtcUsdt,
    EthUsdt,
}

impl Asset {
    pub const ALL: [Asset; 2] = [Asset::BtcUsdt, Asset::EthUsdt];

    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::BtcUsdt => "btcusdt",
            Asset::EthUsdt => "ethusdt",
        }
    }

    /// Uppercase form used by both exchanges' REST and websocket surfaces.
    pub fn symbol_upper(&self) -> &'static str {
        match self {
            Asset::BtcUsdt => "BTCUSDT",
            Asset::EthUsdt => "ETHUSDT",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl FromStr for Asset {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btcusdt" => Ok(Asset::BtcUsdt),
            "ethusdt" => Ok(Asset::EthUsdt),
            other => Err(IngestError::Configuration(format!(
                "unknown asset '{other}'"
            ))),
        }
    }
}

/// Candle resolutions tracked for every asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl TimeFrame {
    pub const ALL: [TimeFrame; 5] = [
        TimeFrame::M5,
        TimeFrame::M15,
        TimeFrame::H1,
        TimeFrame::H4,
        TimeFrame::D1,
    ];

    /// Normalized token stored in the `interval` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M5 => "m5",
            TimeFrame::M15 => "m15",
            TimeFrame::H1 => "h1",
            TimeFrame::H4 => "h4",
            TimeFrame::D1 => "d1",
        }
    }

    /// Interval string for Binance REST and stream channels.
    pub fn binance_interval(&self) -> &'static str {
        match self {
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::H1 => "1h",
            TimeFrame::H4 => "4h",
            TimeFrame::D1 => "1d",
        }
    }

    /// Interval code for Bybit v5 REST and stream topics.
    pub fn bybit_interval(&self) -> &'static str {
        match self {
            TimeFrame::M5 => "5",
            TimeFrame::M15 => "15",
            TimeFrame::H1 => "60",
            TimeFrame::H4 => "240",
            TimeFrame::D1 => "D",
        }
    }

    /// Window length, used where a wire format carries no close time.
    pub fn duration(&self) -> Duration {
        match self {
            TimeFrame::M5 => Duration::minutes(5),
            TimeFrame::M15 => Duration::minutes(15),
            TimeFrame::H1 => Duration::hours(1),
            TimeFrame::H4 => Duration::hours(4),
            TimeFrame::D1 => Duration::days(1),
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TimeFrame {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "m5" | "5m" => Ok(TimeFrame::M5),
            "m15" | "15m" => Ok(TimeFrame::M15),
            "h1" | "1h" => Ok(TimeFrame::H1),
            "h4" | "4h" => Ok(TimeFrame::H4),
            "d1" | "1d" => Ok(TimeFrame::D1),
            other => Err(IngestError::Configuration(format!(
                "unknown timeframe '{other}'"
            ))),
        }
    }
}

/// One tracked (exchange, asset, timeframe) combination. Every streaming
/// task and every backfill step works on exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Market {
    pub exchange: Exchange,
    pub asset: Asset,
    pub time_frame: TimeFrame,
}

impl Market {
    pub fn new(exchange: Exchange, asset: Asset, time_frame: TimeFrame) -> Self {
        Self {
            exchange,
            asset,
            time_frame,
        }
    }

    /// Full cross product in the fixed exchange, asset, timeframe order.
    pub fn all() -> Vec<Market> {
        let mut markets = Vec::with_capacity(
            Exchange::ALL.len() * Asset::ALL.len() * TimeFrame::ALL.len(),
        );
        for exchange in Exchange::ALL {
            for asset in Asset::ALL {
                for time_frame in TimeFrame::ALL {
                    markets.push(Market::new(exchange, asset, time_frame));
                }
            }
        }
        markets
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | {}", self.exchange, self.asset, self.time_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_round_trip() {
        for exchange in Exchange::ALL {
            assert_eq!(exchange.as_str().parse::<Exchange>().unwrap(), exchange);
        }
        assert!("kraken".parse::<Exchange>().is_err());
    }

    #[test]
    fn timeframe_tokens() {
        assert_eq!(TimeFrame::M5.as_str(), "m5");
        assert_eq!(TimeFrame::M5.binance_interval(), "5m");
        assert_eq!(TimeFrame::M5.bybit_interval(), "5");
        assert_eq!(TimeFrame::D1.bybit_interval(), "D");
        assert_eq!(TimeFrame::D1.duration(), Duration::minutes(1440));
        assert_eq!("4h".parse::<TimeFrame>().unwrap(), TimeFrame::H4);
        assert_eq!("h4".parse::<TimeFrame>().unwrap(), TimeFrame::H4);
    }

    #[test]
    fn grid_covers_every_combination() {
        let markets = Market::all();
        assert_eq!(
            markets.len(),
            Exchange::ALL.len() * Asset::ALL.len() * TimeFrame::ALL.len()
        );
        let first = markets.first().unwrap();
        assert_eq!(first.exchange, Exchange::Binance);
        assert_eq!(first.asset, Asset::BtcUsdt);
        assert_eq!(first.time_frame, TimeFrame::M5);
        assert_eq!(format!("{first}"), "binance | btcusdt | m5");
    }
}
