use crate::database::repository::CandleRepository;
use crate::error::IngestError;
use crate::exchange::ExchangeConnector;
use crate::market::Market;
use crate::model::CarryState;
use crate::utils::{retry, RetryPolicy};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, instrument, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Consume the live kline stream for one market until shutdown.
///
/// A session that dies after it was established reconnects here after a
/// short delay. A connect attempt that fails returns the error instead;
/// respawning the task is the supervisor's call. Each candle is
/// persisted together with its derived return before the next frame is
/// read.
#[instrument(skip(connector, repository, policy, shutdown), fields(market = %market))]
pub async fn stream_market(
    connector: Arc<dyn ExchangeConnector>,
    repository: Arc<dyn CandleRepository>,
    policy: RetryPolicy,
    market: Market,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), IngestError> {
    loop {
        let request = connector.stream_request(market);
        info!("Connecting to {} stream", market);
        let (socket, _) = timeout(CONNECT_TIMEOUT, connect_async(request.url.as_str()))
            .await
            .map_err(|_| {
                IngestError::Connection(format!("connect to {} stream timed out", market))
            })??;

        let (mut sink, mut stream) = socket.split();
        if let Some(subscribe) = &request.subscribe {
            sink.send(Message::text(subscribe.clone())).await?;
        }
        info!("Subscribed to {} stream", market);

        // Fresh per session; the first metric after any reconnect
        // reports no previous close.
        let mut carry = CarryState::default();
        let mut ping = interval(PING_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    info!("Stream for {} shut down", market);
                    return Ok(());
                }
                _ = ping.tick() => {
                    if let Some(text) = &request.ping_text {
                        if let Err(e) = sink.send(Message::text(text.clone())).await {
                            warn!("Ping to {} stream failed: {}", market, e);
                            break;
                        }
                    }
                }
                next = timeout(READ_TIMEOUT, stream.next()) => match next {
                    Err(_) => {
                        warn!("No frame from {} stream in {:?}", market, READ_TIMEOUT);
                        break;
                    }
                    Ok(None) => {
                        warn!("{} stream ended", market);
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!("{} stream transport error: {}", market, e);
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match connector.parse_stream_message(market, text.as_str()) {
                            Ok(candles) => {
                                for candle in candles {
                                    let metric = carry.observe(&candle);
                                    let batch = [candle];
                                    retry(&policy, "stream candle upsert", || {
                                        repository.upsert_candles(&batch)
                                    })
                                    .await?;
                                    let metrics = [metric];
                                    retry(&policy, "stream derived upsert", || {
                                        repository.upsert_derived(&metrics)
                                    })
                                    .await?;
                                }
                            }
                            Err(e) => {
                                error!("Dropping {} stream on undecodable frame: {}", market, e);
                                return Err(e);
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        warn!("{} stream closed by venue", market);
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                },
            }
        }

        drop(sink);
        drop(stream);
        sleep(RECONNECT_DELAY).await;
    }
}
