//! Bounded persistence and notification sink.
//!
//! The detector and orchestrator hand records to this channel with a
//! non-blocking send; one worker drains it and talks to Postgres and
//! Slack. A full queue drops the event and counts it - the price-update
//! path never blocks on storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::models::{
    AlertRecord, ExecutionRecord, MinuteStatsRow, NearMissRecord, PortfolioSnapshot,
    ScannerStats, StatsHistoryRow,
};
use common::notify::Notifier;
use common::store;

/// Queue depth. Sized for bursts of alerts across thousands of markets;
/// sustained overflow means the database is the bottleneck, and dropping
/// observability records is preferable to stalling detection.
const SINK_CAPACITY: usize = 1024;

/// Operator notifications routed through the sink.
#[derive(Debug, Clone)]
pub enum Notification {
    Arbitrage {
        market: String,
        yes_ask: Decimal,
        no_ask: Decimal,
        combined: Decimal,
        profit: Decimal,
    },
    PartialFill {
        market: String,
        filled_side: String,
        failed_side: String,
    },
    Message(String),
}

/// Everything the sink can persist or deliver.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Alert(AlertRecord),
    AlertClosed { market: String, duration_secs: f64 },
    NearMiss(NearMissRecord),
    Execution(ExecutionRecord),
    Portfolio(PortfolioSnapshot),
    ScannerStats(ScannerStats),
    StatsHistory(StatsHistoryRow),
    MinuteStats(MinuteStatsRow),
    Notify(Notification),
}

/// Cheap cloneable handle for producers.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkEvent>,
    dropped: Arc<AtomicU64>,
}

impl SinkHandle {
    /// Enqueue without blocking. Drops (and counts) on overflow.
    pub fn emit(&self, event: SinkEvent) {
        if self.tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "Sink queue full, dropping records");
            }
        }
    }

}

/// Create the sink channel and spawn its worker.
pub fn spawn_sink(pool: PgPool, notifier: Arc<Notifier>) -> (SinkHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SINK_CAPACITY);
    let handle = SinkHandle {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let worker = tokio::spawn(run_sink(rx, pool, notifier));
    (handle, worker)
}

async fn run_sink(mut rx: mpsc::Receiver<SinkEvent>, pool: PgPool, notifier: Arc<Notifier>) {
    while let Some(event) = rx.recv().await {
        // Storage failures are logged and swallowed: observability records
        // must never take the trading loop down with them.
        let result = match event {
            SinkEvent::Alert(alert) => store::insert_alert(&pool, &alert).await,
            SinkEvent::AlertClosed {
                market,
                duration_secs,
            } => store::update_alert_duration(&pool, &market, duration_secs)
                .await
                .map(|updated| {
                    if updated {
                        debug!(market = %market, duration_secs, "Alert duration backfilled");
                    }
                }),
            SinkEvent::NearMiss(record) => store::insert_near_miss(&pool, &record).await,
            SinkEvent::Execution(record) => store::insert_execution(&pool, &record).await,
            SinkEvent::Portfolio(snapshot) => {
                store::insert_portfolio_snapshot(&pool, &snapshot).await
            }
            SinkEvent::ScannerStats(stats) => store::update_scanner_stats(&pool, &stats).await,
            SinkEvent::StatsHistory(row) => store::insert_stats_history(&pool, &row).await,
            SinkEvent::MinuteStats(row) => store::insert_minute_stats(&pool, &row).await,
            SinkEvent::Notify(notification) => {
                deliver(&notifier, notification).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "Failed to persist record");
        }
    }
}

async fn deliver(notifier: &Notifier, notification: Notification) {
    match notification {
        Notification::Arbitrage {
            market,
            yes_ask,
            no_ask,
            combined,
            profit,
        } => {
            notifier
                .notify_arbitrage(&market, yes_ask, no_ask, combined, profit)
                .await
        }
        Notification::PartialFill {
            market,
            filled_side,
            failed_side,
        } => {
            notifier
                .notify_partial_fill(&market, &filled_side, &failed_side)
                .await
        }
        Notification::Message(text) => notifier.send_message(&text).await,
    }
}
