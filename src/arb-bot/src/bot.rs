//! Orchestrator: wires the scanner, detector, executor, and balance cache
//! together and owns the single execution lock and the background loops.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use common::chain::{BalanceSource, ChainClient};
use common::clob_api::{ApiCreds, ClobApiClient};
use common::config::Config;
use common::db::Database;
use common::models::{
    ArbAlert, ExecutionRecord, ExecutionStatus, MinuteStatsRow, NearMissReason, NearMissRecord,
    StatsHistoryRow,
};
use common::notify::Notifier;
use common::signing::OrderSigner;

use crate::balance::BalanceCache;
use crate::detector::Detector;
use crate::executor::{size_opportunity, Executor, NegRiskCache, SizingOutcome};
use crate::sink::{spawn_sink, Notification, SinkEvent, SinkHandle};
use crate::stream::{MarketsLoadedHook, Scanner};

/// Auto-redemption cadence (live only).
const REDEMPTION_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Hourly stats snapshot cadence.
const STATS_HISTORY_INTERVAL: Duration = Duration::from_secs(3600);

/// Minute stats cadence.
const MINUTE_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Balance refresh cadence (live only).
const BALANCE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Simulated bankroll for dry-run sizing; without it every opportunity
/// would near-miss on the empty balance cache.
const DRY_RUN_BALANCE: Decimal = dec!(10000);

/// Depth of the detector -> orchestrator opportunity queue.
const EXEC_QUEUE_CAPACITY: usize = 64;

#[derive(Default)]
pub struct BotStats {
    pub opportunities_found: AtomicI64,
    pub trades_executed: AtomicI64,
    pub trades_filled: AtomicI64,
    pub total_profit: Mutex<Decimal>,
}

/// The real-time arbitrage bot.
pub struct RealtimeBot {
    config: Arc<Config>,
    db: Database,
    scanner: Arc<Scanner>,
    api: Arc<ClobApiClient>,
    executor: Executor,
    balance: Arc<BalanceCache>,
    chain: Arc<dyn BalanceSource>,
    sink: SinkHandle,
    notifier: Arc<Notifier>,
    /// Serialises the entire feasibility -> reserve -> submit sequence.
    /// One market at a time, across all markets: the balance cache assumes
    /// a serial view.
    execution_lock: tokio::sync::Mutex<()>,
    stats: BotStats,
    running: AtomicBool,
    shutdown: Notify,
    exec_rx: Mutex<Option<mpsc::Receiver<ArbAlert>>>,
    last_hourly_price_updates: AtomicI64,
    last_minute_price_updates: AtomicI64,
}

impl RealtimeBot {
    pub async fn new(config: Config, db: Database) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let notifier = Arc::new(Notifier::new(config.slack_webhook_url.clone()));
        let (sink, _sink_worker) = spawn_sink(db.pool().clone(), Arc::clone(&notifier));

        let creds = match (&config.poly_api_key, &config.poly_api_secret, &config.poly_api_passphrase)
        {
            (Some(key), Some(secret), Some(passphrase)) => Some(ApiCreds {
                api_key: key.clone(),
                secret: secret.clone(),
                passphrase: passphrase.clone(),
            }),
            _ => None,
        };

        let api = Arc::new(ClobApiClient::new(
            &config.clob_base_url,
            creds,
            config.wallet_address.clone(),
            config.socks5_proxy_url().as_deref(),
        )?);

        let signer = match &config.private_key {
            Some(key) => Some(OrderSigner::from_private_key(key)?),
            None => None,
        };

        let neg_risk = Arc::new(NegRiskCache::default());
        let executor = Executor::new(
            Arc::clone(&api),
            signer,
            Arc::clone(&neg_risk),
            config.dry_run,
        );

        let chain: Arc<dyn BalanceSource> = Arc::new(ChainClient::new(
            &config.polygon_rpc_url,
            config.wallet_address.as_deref().unwrap_or_default(),
        ));
        let balance = Arc::new(BalanceCache::new(Arc::clone(&chain)));

        let detector = Arc::new(Detector::new(
            config.min_profit_threshold,
            config.max_days_until_resolution,
        ));

        let (exec_tx, exec_rx) = mpsc::channel(EXEC_QUEUE_CAPACITY);

        // Prefetch neg_risk for every token right after each market load,
        // off the hot path.
        let hook: MarketsLoadedHook = {
            let api = Arc::clone(&api);
            let neg_risk = Arc::clone(&neg_risk);
            Arc::new(move |registry| {
                let api = Arc::clone(&api);
                let neg_risk = Arc::clone(&neg_risk);
                let tokens: Vec<(String, bool)> = registry
                    .markets()
                    .iter()
                    .flat_map(|m| {
                        [
                            (m.yes_token_id.clone(), m.neg_risk),
                            (m.no_token_id.clone(), m.neg_risk),
                        ]
                    })
                    .collect();
                tokio::spawn(async move {
                    neg_risk.prefetch(&api, tokens).await;
                });
            })
        };

        let scanner = Arc::new(Scanner::new(
            Arc::clone(&config),
            detector,
            exec_tx,
            sink.clone(),
            Some(hook),
        ));

        Ok(Arc::new(Self {
            config,
            db,
            scanner,
            api,
            executor,
            balance,
            chain,
            sink,
            notifier,
            execution_lock: tokio::sync::Mutex::new(()),
            stats: BotStats::default(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            exec_rx: Mutex::new(Some(exec_rx)),
            last_hourly_price_updates: AtomicI64::new(0),
            last_minute_price_updates: AtomicI64::new(0),
        }))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run until stopped. `realtime` selects the streaming scanner; false
    /// falls back to the legacy polling cycle.
    pub async fn run(self: Arc<Self>, realtime: bool) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);

        let mode = if self.config.dry_run { "DRY RUN" } else { "LIVE" };
        info!(
            mode,
            realtime,
            min_profit = %(self.config.min_profit_threshold * Decimal::ONE_HUNDRED),
            max_position = %self.config.max_position_size_usd,
            connections = self.config.num_ws_connections,
            "Starting arbitrage bot"
        );

        self.db.init_schema().await?;
        self.notifier.notify_startup(mode).await;

        let mut background: Vec<JoinHandle<()>> = Vec::new();

        if self.config.dry_run {
            self.balance.seed(DRY_RUN_BALANCE).await;
            info!(balance = %DRY_RUN_BALANCE, "Simulated balance seeded for dry run");
        } else {
            // First refresh on startup; its value is logged and recorded.
            match self.balance.refresh().await {
                Ok((balance, snapshot)) => {
                    info!(balance = %balance, "Balance tracking initialized");
                    self.sink.emit(SinkEvent::Portfolio(snapshot));
                }
                Err(e) => error!(error = %e, "Initial balance refresh failed"),
            }
            background.push(tokio::spawn(
                Arc::clone(&self).balance_refresh_loop(),
            ));
            background.push(tokio::spawn(Arc::clone(&self).redemption_loop()));
        }

        background.push(tokio::spawn(Arc::clone(&self).stats_history_loop()));
        background.push(tokio::spawn(Arc::clone(&self).minute_stats_loop()));

        let exec_rx = self
            .exec_rx
            .lock()
            .expect("exec_rx lock poisoned")
            .take()
            .expect("run called twice");
        let execution = tokio::spawn(Arc::clone(&self).execution_loop(exec_rx));

        let result = if realtime {
            Arc::clone(&self.scanner).run().await
        } else {
            self.polling_loop().await
        };

        // The scanner returned: either stop() was called or startup failed.
        self.shutdown_internal(background, execution).await;
        result
    }

    /// Legacy polling cycle: fetch every candidate book over HTTP each
    /// interval and push it through the same store-and-detect path.
    async fn polling_loop(&self) -> Result<()> {
        self.scanner.load_markets().await?;
        let mut last_refresh = std::time::Instant::now();

        info!(
            interval_secs = self.config.poll_interval_seconds,
            "Polling mode started"
        );

        while self.is_running() {
            if last_refresh.elapsed() >= Duration::from_secs(600) {
                if let Err(e) = self.scanner.load_markets().await {
                    // Keep the previous market set; retry next cycle.
                    error!(error = %e, "Market refresh failed");
                }
                last_refresh = std::time::Instant::now();
            }

            let registry = self.scanner.current_registry();
            let tokens = registry.token_ids();
            let api = Arc::clone(&self.api);

            let books: Vec<_> = futures_util::stream::iter(tokens)
                .map(|token_id| {
                    let api = Arc::clone(&api);
                    async move { api.get_book(&token_id).await }
                })
                .buffer_unordered(32)
                .collect()
                .await;

            let mut fetched = 0usize;
            for book in books {
                match book {
                    Ok(book) => {
                        fetched += 1;
                        self.scanner.ingest_book(&book);
                    }
                    Err(e) => warn!(error = %e, "Book fetch failed"),
                }
            }
            info!(books = fetched, "Poll cycle complete");

            sleep(Duration::from_secs_f64(
                self.config.poll_interval_seconds.max(0.5),
            ))
            .await;
        }

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping bot");
        self.running.store(false, Ordering::Relaxed);
        self.scanner.stop();
        self.shutdown.notify_waiters();
    }

    async fn shutdown_internal(
        &self,
        background: Vec<JoinHandle<()>>,
        execution: JoinHandle<()>,
    ) {
        info!("Shutting down");
        self.running.store(false, Ordering::Relaxed);
        self.scanner.stop();
        self.shutdown.notify_waiters();

        // In-flight submissions finish; the loop exits at the next idle
        // point.
        if tokio::time::timeout(Duration::from_secs(30), execution)
            .await
            .is_err()
        {
            warn!("Execution loop did not drain in time");
        }

        for task in background {
            task.abort();
        }

        self.notifier.notify_shutdown("normal").await;

        // Final statistics flush.
        let stats = self.scanner.stats_snapshot();
        self.sink.emit(SinkEvent::ScannerStats(stats.clone()));
        info!(
            markets = stats.markets,
            price_updates = stats.price_updates,
            opportunities = self.stats.opportunities_found.load(Ordering::Relaxed),
            trades = self.stats.trades_executed.load(Ordering::Relaxed),
            filled = self.stats.trades_filled.load(Ordering::Relaxed),
            profit = %self.total_profit(),
            "Bot statistics"
        );
        sleep(Duration::from_millis(500)).await; // let the sink drain
    }

    fn total_profit(&self) -> Decimal {
        *self.stats.total_profit.lock().expect("profit lock poisoned")
    }

    /// Consume detector alerts one at a time.
    async fn execution_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ArbAlert>) {
        // Register for shutdown up front so a notify that lands while an
        // execution is in flight is not lost.
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                alert = rx.recv() => match alert {
                    Some(alert) => self.handle_alert(alert).await,
                    None => break,
                },
            }
        }
    }

    /// The detect -> reserve -> submit sequence, serialised by the
    /// execution lock.
    async fn handle_alert(&self, alert: ArbAlert) {
        self.stats.opportunities_found.fetch_add(1, Ordering::Relaxed);

        let _guard = self.execution_lock.lock().await;

        let cached_balance = self.balance.read().await;
        let sized = match size_opportunity(&alert, self.config.max_position_size_usd, cached_balance)
        {
            SizingOutcome::NearMiss {
                reason,
                min_required,
            } => {
                warn!(
                    market = alert.market.short_question(40),
                    reason = %reason.as_record_str(),
                    min_required = %min_required,
                    yes_available = %alert.yes_size,
                    no_available = %alert.no_size,
                    "Skipping arbitrage"
                );
                self.emit_near_miss(&alert, &reason, min_required);
                return;
            }
            SizingOutcome::Sized {
                trade_size,
                required_cost,
                ..
            } => (trade_size, required_cost),
        };
        let (trade_size, required_cost) = sized;

        if !self.balance.reserve(required_cost).await {
            // The cache moved between read and reserve (a refresh landed).
            let reason = NearMissReason::InsufficientBalance {
                required: required_cost,
                available: self.balance.read().await,
            };
            self.emit_near_miss(&alert, &reason, required_cost);
            return;
        }

        info!(
            market = alert.market.short_question(40),
            trade_size = %trade_size,
            cost = %required_cost,
            balance = %cached_balance,
            "Executing with liquidity-adjusted size"
        );

        self.stats.trades_executed.fetch_add(1, Ordering::Relaxed);

        match self.executor.execute(&alert, trade_size, required_cost).await {
            Ok(report) => {
                self.sink
                    .emit(SinkEvent::Execution(execution_record(&alert, &report)));

                match report.status {
                    ExecutionStatus::Filled => {
                        self.stats.trades_filled.fetch_add(1, Ordering::Relaxed);
                        let mut profit =
                            self.stats.total_profit.lock().expect("profit lock poisoned");
                        *profit += report.expected_profit;
                    }
                    ExecutionStatus::Partial => {
                        let (filled_side, failed_side) = if report.yes.succeeded() {
                            ("YES", "NO")
                        } else {
                            ("NO", "YES")
                        };
                        self.sink.emit(SinkEvent::Notify(Notification::PartialFill {
                            market: alert.market.question.clone(),
                            filled_side: filled_side.to_string(),
                            failed_side: failed_side.to_string(),
                        }));
                        self.refresh_after_failure("partial execution").await;
                    }
                    ExecutionStatus::Failed => {
                        self.refresh_after_failure("failed execution").await;
                    }
                }
            }
            Err(e) => {
                error!(
                    market = alert.market.short_question(30),
                    error = %e,
                    "Execution error - refreshing balance"
                );
                self.refresh_after_failure("execution error").await;
            }
        }
    }

    /// Never credit the reservation back: re-read the chain instead. A
    /// concurrent refresh may already reflect partial fills.
    async fn refresh_after_failure(&self, cause: &str) {
        if self.config.dry_run {
            return;
        }
        match self.balance.refresh().await {
            Ok((balance, snapshot)) => {
                warn!(cause, new_balance = %balance, "Refreshed balance after failure");
                self.sink.emit(SinkEvent::Portfolio(snapshot));
            }
            Err(e) => error!(cause, error = %e, "Balance refresh failed"),
        }
    }

    fn emit_near_miss(&self, alert: &ArbAlert, reason: &NearMissReason, min_required: Decimal) {
        self.sink.emit(SinkEvent::NearMiss(NearMissRecord {
            timestamp: Utc::now(),
            market: alert.market.short_question(60).to_string(),
            yes_ask: alert.yes_ask,
            no_ask: alert.no_ask,
            combined: alert.combined_ask,
            profit_pct: alert.profit,
            yes_liquidity: alert.yes_size,
            no_liquidity: alert.no_size,
            min_required,
            reason: reason.as_record_str(),
        }));
    }

    /// Background task that periodically refreshes the cached balance.
    async fn balance_refresh_loop(self: Arc<Self>) {
        while self.is_running() {
            sleep(BALANCE_REFRESH_INTERVAL).await;
            if !self.is_running() {
                break;
            }
            match self.balance.refresh().await {
                Ok((_, snapshot)) => self.sink.emit(SinkEvent::Portfolio(snapshot)),
                Err(e) => error!(error = %e, "Balance refresh loop error"),
            }
        }
    }

    /// Background task that surfaces resolved positions to the redemption
    /// collaborator (live only).
    async fn redemption_loop(self: Arc<Self>) {
        sleep(Duration::from_secs(60)).await;
        info!(interval_secs = REDEMPTION_CHECK_INTERVAL.as_secs(), "Auto-redemption task started");

        while self.is_running() {
            match self.chain.positions().await {
                Ok(positions) => {
                    let redeemable: Vec<_> = positions
                        .iter()
                        .filter(|p| p.redeemable == Some(true))
                        .collect();
                    if !redeemable.is_empty() {
                        let value: f64 = redeemable
                            .iter()
                            .map(|p| p.size * p.cur_price.unwrap_or(1.0))
                            .sum();
                        info!(
                            count = redeemable.len(),
                            value,
                            "Resolved positions ready for redemption"
                        );
                        self.sink.emit(SinkEvent::Notify(Notification::Message(format!(
                            "{} resolved position(s) worth ${:.2} ready for redemption",
                            redeemable.len(),
                            value
                        ))));
                    }
                }
                Err(e) => error!(error = %e, "Auto-redemption check failed"),
            }

            sleep(REDEMPTION_CHECK_INTERVAL).await;
        }
    }

    /// Background task that records hourly stats snapshots for charting.
    async fn stats_history_loop(self: Arc<Self>) {
        sleep(Duration::from_secs(60)).await;
        info!(interval_secs = STATS_HISTORY_INTERVAL.as_secs(), "Stats history task started");

        while self.is_running() {
            let stats = self.scanner.stats_snapshot();
            let delta = stats.price_updates
                - self
                    .last_hourly_price_updates
                    .swap(stats.price_updates, Ordering::Relaxed);

            let now = Utc::now();
            self.sink.emit(SinkEvent::StatsHistory(StatsHistoryRow {
                timestamp: now,
                hour: now.format("%Y-%m-%d %H:00").to_string(),
                markets: stats.markets,
                price_updates: delta,
                arbitrage_alerts: self.stats.opportunities_found.load(Ordering::Relaxed),
                executions_attempted: self.stats.trades_executed.load(Ordering::Relaxed),
                executions_filled: self.stats.trades_filled.load(Ordering::Relaxed),
                ws_connected: stats.ws_connected,
            }));

            sleep(STATS_HISTORY_INTERVAL).await;
        }
    }

    /// Background task that records minute-grained price-update deltas.
    async fn minute_stats_loop(self: Arc<Self>) {
        sleep(Duration::from_secs(10)).await;

        // Baseline from the current counter so the first recorded delta
        // after a restart is not a spike.
        let baseline = self.scanner.stats_snapshot().price_updates;
        self.last_minute_price_updates.store(baseline, Ordering::Relaxed);
        info!(interval_secs = MINUTE_STATS_INTERVAL.as_secs(), "Minute stats task started");

        while self.is_running() {
            sleep(MINUTE_STATS_INTERVAL).await;
            if !self.is_running() {
                break;
            }

            let stats = self.scanner.stats_snapshot();
            let delta = stats.price_updates
                - self
                    .last_minute_price_updates
                    .swap(stats.price_updates, Ordering::Relaxed);

            let now = Utc::now();
            self.sink.emit(SinkEvent::MinuteStats(MinuteStatsRow {
                timestamp: now,
                minute: now.format("%Y-%m-%d %H:%M").to_string(),
                price_updates: delta,
                ws_connected: stats.ws_connected,
            }));
        }
    }
}

/// Build the persisted execution record from an alert and its report.
fn execution_record(
    alert: &ArbAlert,
    report: &common::models::ExecutionReport,
) -> ExecutionRecord {
    ExecutionRecord {
        timestamp: Utc::now(),
        market: alert.market.short_question(60).to_string(),
        status: report.status.as_str().to_string(),
        yes_order_id: report.yes.order_id.clone(),
        yes_status: Some(report.yes.status.clone()),
        yes_price: report.yes_price,
        yes_size: report.trade_size,
        yes_filled_size: report.yes.filled_size,
        no_order_id: report.no.order_id.clone(),
        no_status: Some(report.no.status.clone()),
        no_price: report.no_price,
        no_size: report.trade_size,
        no_filled_size: report.no.filled_size,
        total_cost: report.total_cost,
        expected_profit: report.expected_profit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{ExecutionReport, Market, OrderResult};
    use std::sync::Arc as StdArc;

    fn alert() -> ArbAlert {
        let now = Utc::now();
        ArbAlert {
            market: StdArc::new(Market {
                id: "c1".to_string(),
                question: "Will it settle?".to_string(),
                yes_token_id: "y".to_string(),
                no_token_id: "n".to_string(),
                neg_risk: false,
                end_date: None,
                liquidity: dec!(50000),
            }),
            yes_ask: dec!(0.45),
            no_ask: dec!(0.48),
            combined_ask: dec!(0.93),
            profit: dec!(0.07),
            yes_size: dec!(100),
            no_size: dec!(100),
            first_seen: now,
            detected_at: now,
        }
    }

    #[test]
    fn test_execution_record_mapping() {
        let report = ExecutionReport {
            status: ExecutionStatus::Partial,
            trade_size: dec!(50),
            total_cost: dec!(46.50),
            expected_profit: dec!(0),
            yes_price: dec!(0.45),
            no_price: dec!(0.48),
            yes: OrderResult {
                order_id: Some("0xyes".into()),
                status: "live".into(),
                filled_size: dec!(50),
                error: None,
            },
            no: OrderResult {
                order_id: None,
                status: "rejected".into(),
                filled_size: dec!(0),
                error: Some("nope".into()),
            },
        };

        let record = execution_record(&alert(), &report);
        assert_eq!(record.status, "PARTIAL");
        assert_eq!(record.yes_order_id.as_deref(), Some("0xyes"));
        assert_eq!(record.no_order_id, None);
        assert_eq!(record.yes_size, dec!(50));
        assert_eq!(record.no_size, dec!(50));
        assert_eq!(record.total_cost, dec!(46.50));
    }
}
