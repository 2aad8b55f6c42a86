pub mod binance;
pub mod bybit;

pub use binance::{BinanceConnector, BinanceKlineSource};
pub use bybit::BybitConnector;

use crate::error::IngestError;
use crate::market::{Exchange, Market};
use crate::model::Candle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection recipe for a venue's live kline stream.
pub struct StreamRequest {
    pub url: String,
    /// Text frame to send right after connecting, for venues that
    /// expect an explicit subscription.
    pub subscribe: Option<String>,
    /// Application-level ping frame the venue expects on a schedule,
    /// for venues that do not rely on protocol pings.
    pub ping_text: Option<String>,
}

/// Venue-specific REST and websocket plumbing. Implementations return
/// fully normalized candles so the rest of the pipeline never sees
/// venue wire formats.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Fetch one page of candles opening at or after `start`, oldest
    /// first. An empty page means the venue has no data for the range.
    async fn fetch_page(
        &self,
        market: Market,
        start: DateTime<Utc>,
    ) -> Result<Vec<Candle>, IngestError>;

    fn stream_request(&self, market: Market) -> StreamRequest;

    /// Decode one text frame from the live stream. Control frames
    /// (subscription acks, pongs) decode to an empty batch; a kline
    /// push yields every candle it lists.
    fn parse_stream_message(
        &self,
        market: Market,
        text: &str,
    ) -> Result<Vec<Candle>, IngestError>;
}

/// REST client shared by the connectors. Both timeouts are explicit; a
/// venue that stops responding must fail the fetch instead of pending
/// forever underneath the retry wrapper.
pub(crate) fn http_client() -> Result<Client, IngestError> {
    http_client_with(HTTP_CONNECT_TIMEOUT, HTTP_REQUEST_TIMEOUT)
}

fn http_client_with(connect: Duration, request: Duration) -> Result<Client, IngestError> {
    Client::builder()
        .connect_timeout(connect)
        .timeout(request)
        .build()
        .map_err(|e| IngestError::Configuration(format!("http client construction failed: {e}")))
}

pub fn connector_for(exchange: Exchange) -> Result<Arc<dyn ExchangeConnector>, IngestError> {
    connector_with_source(exchange, BinanceKlineSource::Spot)
}

/// Connector with an explicit Binance kline source; only backfill
/// sweeps pass anything other than spot. Bybit has a single listing.
pub fn connector_with_source(
    exchange: Exchange,
    source: BinanceKlineSource,
) -> Result<Arc<dyn ExchangeConnector>, IngestError> {
    Ok(match exchange {
        Exchange::Binance => Arc::new(BinanceConnector::with_source(source)?),
        Exchange::Bybit => Arc::new(BybitConnector::new()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stalled_rest_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Swallow the request and never answer.
            let mut buf = [0u8; 1024];
            while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let client =
            http_client_with(Duration::from_millis(200), Duration::from_millis(200)).unwrap();
        let err = client
            .get(format!("http://{addr}/v5/market/kline"))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
