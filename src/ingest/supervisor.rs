use crate::database::repository::CandleRepository;
use crate::error::IngestError;
use crate::exchange::{connector_for, BinanceKlineSource, ExchangeConnector};
use crate::ingest::backfill::run_sweep;
use crate::ingest::stream::stream_market;
use crate::market::{Exchange, Market};
use crate::utils::RetryPolicy;
use anyhow::Result;
use chrono::{Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const SWEEP_TRIGGER_DAY: u32 = 2;

type StreamSlot = (
    Market,
    Arc<dyn ExchangeConnector>,
    JoinHandle<Result<(), IngestError>>,
);

/// Schedules the monthly sweep: fires on the trigger day at most once
/// per month. Starts unarmed so a process launched on the trigger day
/// does not double up with the startup sweep.
#[derive(Debug, Default)]
pub struct BackfillLatch {
    armed: bool,
}

impl BackfillLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report today's day of month; true means a sweep should start
    /// now. The latch re-arms only once the day moves off the trigger
    /// day again.
    pub fn observe(&mut self, day: u32) -> bool {
        if day == SWEEP_TRIGGER_DAY {
            let fire = self.armed;
            self.armed = false;
            fire
        } else {
            self.armed = true;
            false
        }
    }
}

/// Owns the full grid: one streaming task per market plus the backfill
/// sweep task, all restarted when they stop for any reason.
pub struct Supervisor {
    repository: Arc<dyn CandleRepository>,
    policy: RetryPolicy,
    source: BinanceKlineSource,
}

impl Supervisor {
    pub fn new(
        repository: Arc<dyn CandleRepository>,
        policy: RetryPolicy,
        source: BinanceKlineSource,
    ) -> Self {
        Self {
            repository,
            policy,
            source,
        }
    }

    fn spawn_stream(
        &self,
        connector: &Arc<dyn ExchangeConnector>,
        market: Market,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), IngestError>> {
        tokio::spawn(stream_market(
            Arc::clone(connector),
            Arc::clone(&self.repository),
            self.policy.clone(),
            market,
            shutdown,
        ))
    }

    fn spawn_sweep(&self) -> JoinHandle<()> {
        tokio::spawn(run_sweep(
            Arc::clone(&self.repository),
            self.policy.clone(),
            self.source,
        ))
    }

    /// Run until `shutdown` flips. Dead tasks are found by a level
    /// check; the grid is small, so polling every 500ms is cheaper than
    /// wiring completion notifications through every task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let markets = Market::all();
        info!(
            "Supervising {} streaming tasks and the backfill sweep",
            markets.len()
        );

        // One REST/stream connector per exchange, shared by its markets
        // and kept across restarts.
        let mut tasks: Vec<StreamSlot> = Vec::with_capacity(markets.len());
        for exchange in Exchange::ALL {
            let connector = connector_for(exchange)?;
            for &market in markets.iter().filter(|m| m.exchange == exchange) {
                let handle = self.spawn_stream(&connector, market, shutdown.clone());
                tasks.push((market, Arc::clone(&connector), handle));
            }
        }

        let mut sweep = self.spawn_sweep();
        let mut latch = BackfillLatch::new();

        let mut poll = interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = poll.tick() => {}
            }

            for (market, connector, handle) in tasks.iter_mut() {
                if handle.is_finished() {
                    match (&mut *handle).await {
                        Ok(Ok(())) => info!("Stream task for {} exited, restarting", market),
                        Ok(Err(e)) => warn!("Stream task for {} died: {}, restarting", market, e),
                        Err(e) => warn!("Stream task for {} panicked: {}, restarting", market, e),
                    }
                    *handle = self.spawn_stream(connector, *market, shutdown.clone());
                }
            }

            // The trigger is only consulted between sweeps; two sweeps
            // never overlap.
            if sweep.is_finished() && latch.observe(Utc::now().day()) {
                info!("Monthly backfill trigger fired");
                sweep = self.spawn_sweep();
            }
        }

        info!("Supervisor shutting down");
        sweep.abort();
        let _ = sweep.await;
        for (_, _, handle) in tasks {
            let _ = handle.await;
        }
        Ok(())
    }
}
