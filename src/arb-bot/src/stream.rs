//! Fan-out streaming scanner.
//!
//! Shards the token list across N WebSocket connections, keeps the
//! top-of-book store current, and runs the detector inline on every
//! update. Each connection has an independent listen/reconnect loop; a
//! watchdog force-closes connections that go silent, and a periodic
//! refresh re-fetches the market set.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use common::config::Config;
use common::gamma::GammaClient;
use common::models::{AlertRecord, ArbAlert, ScannerStats};
use common::ws::{BookEvent, PriceChangeEvent, StreamClient, StreamEvent, WsStream, ZOMBIE_CLOSE_CODE};

use crate::detector::{Detector, DetectorOutcome};
use crate::registry::{LadderLevel, Registry};
use crate::sink::{Notification, SinkEvent, SinkHandle};

/// A single physical connection is capped at 500 assets (250 markets).
pub const MAX_ASSETS_PER_CONNECTION: usize = 500;

/// Watchdog cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// A connection silent for longer than this is a zombie.
const STALE_THRESHOLD_SECS: u64 = 60;

/// Market set refresh cadence.
const MARKET_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Market-count change that triggers a full reconnect.
const RESUBSCRIBE_TOLERANCE: i64 = 10;

/// Periodic stats cadence.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(10);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared per-connection state, visible to the watchdog and stats loop.
pub struct ConnState {
    connected: AtomicBool,
    last_msg_ms: AtomicU64,
    subscribed: AtomicUsize,
    force_close: Notify,
}

impl ConnState {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_msg_ms: AtomicU64::new(unix_millis()),
            subscribed: AtomicUsize::new(0),
            force_close: Notify::new(),
        }
    }

    fn touch(&self) {
        self.last_msg_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn seconds_silent(&self) -> u64 {
        unix_millis()
            .saturating_sub(self.last_msg_ms.load(Ordering::Relaxed))
            / 1000
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.load(Ordering::Relaxed)
    }
}

/// The shard of the ordered token list owned by one connection.
pub fn shard_tokens(tokens: &[String], conn_id: usize) -> Vec<String> {
    tokens
        .iter()
        .skip(conn_id * MAX_ASSETS_PER_CONNECTION)
        .take(MAX_ASSETS_PER_CONNECTION)
        .cloned()
        .collect()
}

/// Callback invoked after each market load (neg_risk prefetch etc).
pub type MarketsLoadedHook = Arc<dyn Fn(Arc<Registry>) + Send + Sync>;

pub struct Scanner {
    config: Arc<Config>,
    gamma: GammaClient,
    client: StreamClient,
    registry: RwLock<Arc<Registry>>,
    detector: Arc<Detector>,
    conn_states: Vec<Arc<ConnState>>,
    running: AtomicBool,
    price_updates: AtomicU64,
    arbitrage_alerts: AtomicU64,
    exec_tx: mpsc::Sender<ArbAlert>,
    sink: SinkHandle,
    on_markets_loaded: Option<MarketsLoadedHook>,
}

impl Scanner {
    pub fn new(
        config: Arc<Config>,
        detector: Arc<Detector>,
        exec_tx: mpsc::Sender<ArbAlert>,
        sink: SinkHandle,
        on_markets_loaded: Option<MarketsLoadedHook>,
    ) -> Self {
        let gamma = GammaClient::new(&config.gamma_base_url);
        let client = StreamClient::new(&config.clob_ws_url);
        let conn_states = (0..config.num_ws_connections)
            .map(|_| Arc::new(ConnState::new()))
            .collect();

        Self {
            config,
            gamma,
            client,
            registry: RwLock::new(Arc::new(Registry::new(Vec::new()))),
            detector,
            conn_states,
            running: AtomicBool::new(false),
            price_updates: AtomicU64::new(0),
            arbitrage_alerts: AtomicU64::new(0),
            exec_tx,
            sink,
            on_markets_loaded,
        }
    }

    pub fn current_registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry.read().expect("registry lock poisoned"))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Each connection handles 500 assets, i.e. 250 markets.
    fn max_markets(&self) -> usize {
        (MAX_ASSETS_PER_CONNECTION / 2) * self.config.num_ws_connections
    }

    /// Fetch the market set, keep the most liquid candidates, and swap in a
    /// fresh registry.
    pub async fn load_markets(&self) -> Result<Arc<Registry>> {
        let mut markets = self
            .gamma
            .fetch_active_markets(
                self.config.min_liquidity_usd,
                self.config.max_days_until_resolution,
            )
            .await?;

        markets.sort_by(|a, b| b.liquidity.cmp(&a.liquidity));
        markets.truncate(self.max_markets());

        let registry = Arc::new(Registry::new(markets));
        *self.registry.write().expect("registry lock poisoned") = Arc::clone(&registry);

        info!(
            count = registry.market_count(),
            min_liquidity = %self.config.min_liquidity_usd,
            max_days = self.config.max_days_until_resolution,
            "Markets loaded"
        );

        if let Some(hook) = &self.on_markets_loaded {
            hook(Arc::clone(&registry));
        }

        Ok(registry)
    }

    /// Run the scanner until `stop` is called: one listen loop per
    /// connection plus the watchdog, market refresh, and stats tasks.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);

        if self.current_registry().market_count() == 0 {
            self.load_markets().await?;
        }

        let mut tasks = JoinSet::new();

        for conn_id in 0..self.conn_states.len() {
            let scanner = Arc::clone(&self);
            tasks.spawn(async move { scanner.connection_loop(conn_id).await });
        }
        {
            let scanner = Arc::clone(&self);
            tasks.spawn(async move { scanner.watchdog_loop().await });
        }
        {
            let scanner = Arc::clone(&self);
            tasks.spawn(async move { scanner.refresh_loop().await });
        }
        {
            let scanner = Arc::clone(&self);
            tasks.spawn(async move { scanner.stats_loop().await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Scanner task panicked");
                }
            }
        }

        Ok(())
    }

    /// Stop all loops and wake blocked listeners so they exit promptly.
    pub fn stop(&self) {
        info!("Stopping scanner");
        self.running.store(false, Ordering::Relaxed);
        for state in &self.conn_states {
            state.force_close.notify_waiters();
        }
    }

    /// One connection's listen loop with reconnect and backoff.
    async fn connection_loop(self: Arc<Self>, conn_id: usize) {
        let state = Arc::clone(&self.conn_states[conn_id]);
        let mut reconnect_delay = Duration::from_secs(1);

        while self.is_running() {
            let tokens = shard_tokens(&self.current_registry().token_ids(), conn_id);
            if tokens.is_empty() {
                // Nothing to subscribe on this shard; re-check after the
                // next market refresh could have grown the token list.
                state.subscribed.store(0, Ordering::Relaxed);
                sleep(Duration::from_secs(30)).await;
                continue;
            }

            match self.client.connect().await {
                Ok(mut ws) => {
                    info!(conn = conn_id + 1, tokens = tokens.len(), "WebSocket connected");
                    state.connected.store(true, Ordering::Relaxed);
                    state.touch();

                    match self.client.subscribe(&mut ws, &tokens).await {
                        Ok(()) => {
                            state.subscribed.store(tokens.len(), Ordering::Relaxed);
                            self.listen(conn_id, &mut ws, &state).await;
                        }
                        Err(e) => {
                            error!(conn = conn_id + 1, error = %e, "Subscription failed");
                        }
                    }

                    state.connected.store(false, Ordering::Relaxed);
                    state.subscribed.store(0, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(conn = conn_id + 1, error = %e, "Connection failed");
                }
            }

            if !self.is_running() {
                break;
            }

            let delay = reconnect_delay.min(Duration::from_secs(30));
            info!(conn = conn_id + 1, delay_secs = delay.as_secs(), "Reconnecting");
            sleep(delay).await;
            reconnect_delay = (delay * 2).min(Duration::from_secs(60));
        }
    }

    /// Drain one connection until it errors, closes, or is force-closed.
    async fn listen(&self, conn_id: usize, ws: &mut WsStream, state: &ConnState) {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !self.is_running() {
                self.client.close_with_code(ws, 1000, "shutdown").await;
                return;
            }

            tokio::select! {
                _ = state.force_close.notified() => {
                    warn!(conn = conn_id + 1, "Force-closing connection");
                    self.client
                        .close_with_code(ws, ZOMBIE_CLOSE_CODE, "zombie connection")
                        .await;
                    return;
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = self.client.send_ping(ws).await {
                        warn!(conn = conn_id + 1, error = %e, "Keepalive ping failed");
                        return;
                    }
                }
                event = self.client.read_event(ws) => {
                    match event {
                        Ok(Some(event)) => {
                            state.touch();
                            self.dispatch(event);
                        }
                        Ok(None) => state.touch(),
                        Err(e) => {
                            warn!(conn = conn_id + 1, error = %e, "WebSocket listen ended");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Ingest a REST-fetched book snapshot (legacy polling mode) through
    /// the same store-and-detect path the stream uses.
    pub fn ingest_book(&self, book: &BookEvent) {
        let registry = self.current_registry();
        self.apply_book(&registry, book);
    }

    /// Route one stream event into the store and detector. Synchronous:
    /// the price-update path must not await.
    fn dispatch(&self, event: StreamEvent) {
        let registry = self.current_registry();
        match event {
            StreamEvent::Book(book) => self.apply_book(&registry, &book),
            StreamEvent::Books(books) => {
                debug!(count = books.len(), "Book snapshot batch");
                for book in &books {
                    self.apply_book(&registry, book);
                }
            }
            StreamEvent::PriceChanges(changes) => {
                for change in &changes {
                    self.price_updates.fetch_add(1, Ordering::Relaxed);
                    self.apply_change(&registry, change);
                }
            }
            StreamEvent::Ping | StreamEvent::Ack => {}
            StreamEvent::Unknown(msg) => debug!(msg = %msg, "Unknown stream message"),
        }
    }

    /// Full ladder replace for one asset.
    fn apply_book(&self, registry: &Arc<Registry>, book: &BookEvent) {
        let Some((idx, side)) = registry.lookup_token(&book.asset_id) else {
            return;
        };

        let asks: Vec<LadderLevel> = book
            .asks
            .iter()
            .filter_map(|l| {
                Some(LadderLevel {
                    price: l.price_decimal()?,
                    size: l.size_decimal()?,
                })
            })
            .collect();
        registry.replace_ladder(&book.asset_id, asks);

        let snapshot = registry.apply_update(
            idx,
            side,
            book.best_bid(),
            book.best_ask(),
            book.ask_size_at_best(),
        );
        self.run_detector(registry, idx, &snapshot);
    }

    /// Incremental update for one asset. A SELL change at the best ask
    /// carries the authoritative size; anything else recomputes from the
    /// shared ladder cache.
    fn apply_change(&self, registry: &Arc<Registry>, change: &PriceChangeEvent) {
        let Some((idx, side)) = registry.lookup_token(&change.asset_id) else {
            return;
        };

        let price = change.price_decimal();
        let size = change.size_decimal();
        let best_ask = change.best_ask_decimal();

        if change.side == "SELL" {
            if let (Some(price), Some(size)) = (price, size) {
                registry.apply_ladder_change(&change.asset_id, price, size);
            }
        }

        let ask_size = if change.side == "SELL" && best_ask.is_some() && price == best_ask {
            size
        } else {
            registry
                .ladder_ask_size(&change.asset_id)
                .map(|(_, size)| size)
        };

        let snapshot =
            registry.apply_update(idx, side, change.best_bid_decimal(), best_ask, ask_size);
        self.run_detector(registry, idx, &snapshot);
    }

    fn run_detector(
        &self,
        registry: &Arc<Registry>,
        idx: usize,
        snapshot: &common::models::MarketPrices,
    ) {
        match self.detector.on_update(registry, idx, snapshot, Utc::now()) {
            DetectorOutcome::None => {}
            DetectorOutcome::Closed {
                market,
                duration_secs,
            } => {
                info!(
                    market = market.short_question(40),
                    duration_secs, "Opportunity closed"
                );
                self.sink.emit(SinkEvent::AlertClosed {
                    market: market.short_question(60).to_string(),
                    duration_secs,
                });
            }
            DetectorOutcome::Opportunity {
                alert,
                newly_opened,
            } => {
                self.arbitrage_alerts.fetch_add(1, Ordering::Relaxed);

                info!(
                    market = alert.market.short_question(50),
                    yes_ask = %alert.yes_ask,
                    no_ask = %alert.no_ask,
                    combined = %alert.combined_ask,
                    profit_pct = %(alert.profit * Decimal::ONE_HUNDRED),
                    yes_liq = %alert.yes_size,
                    no_liq = %alert.no_size,
                    "ARBITRAGE DETECTED"
                );

                // Execution first - it is time critical. The record and the
                // notification ride the sink.
                if self.exec_tx.try_send(alert.clone()).is_err() {
                    warn!(
                        market = alert.market.short_question(40),
                        "Execution queue full, dropping opportunity"
                    );
                }

                if newly_opened {
                    let now = alert.detected_at;
                    self.sink.emit(SinkEvent::Alert(AlertRecord {
                        market: alert.market.short_question(60).to_string(),
                        yes_ask: alert.yes_ask,
                        no_ask: alert.no_ask,
                        combined: alert.combined_ask,
                        profit: alert.profit,
                        timestamp: now,
                        platform: "polymarket".to_string(),
                        days_until_resolution: alert.market.days_until_resolution(now),
                        resolution_date: alert.market.end_date,
                        first_seen: Some(alert.first_seen),
                        duration_secs: None,
                    }));
                    self.sink.emit(SinkEvent::Notify(Notification::Arbitrage {
                        market: alert.market.question.clone(),
                        yes_ask: alert.yes_ask,
                        no_ask: alert.no_ask,
                        combined: alert.combined_ask,
                        profit: alert.profit,
                    }));
                }
            }
        }
    }

    /// Detect and break zombie connections: open but silent past the
    /// threshold. Many exchanges drop clients without a close frame.
    async fn watchdog_loop(self: Arc<Self>) {
        sleep(WATCHDOG_INTERVAL).await;

        while self.is_running() {
            for (i, state) in self.conn_states.iter().enumerate() {
                if !state.is_connected() {
                    continue;
                }
                let silent = state.seconds_silent();
                if silent > STALE_THRESHOLD_SECS {
                    warn!(
                        conn = i + 1,
                        seconds_silent = silent,
                        threshold = STALE_THRESHOLD_SECS,
                        "Zombie connection detected - forcing reconnect"
                    );
                    state.force_close.notify_waiters();
                }
            }
            sleep(WATCHDOG_INTERVAL).await;
        }
    }

    /// Re-fetch the market set every 10 minutes; on a significant change,
    /// bounce every connection so shards re-form over the new token list.
    async fn refresh_loop(self: Arc<Self>) {
        while self.is_running() {
            sleep(MARKET_REFRESH_INTERVAL).await;
            if !self.is_running() {
                break;
            }

            let old_count = self.current_registry().market_count() as i64;
            match self.load_markets().await {
                Ok(registry) => {
                    let new_count = registry.market_count() as i64;
                    if (new_count - old_count).abs() > RESUBSCRIBE_TOLERANCE {
                        info!(
                            old = old_count,
                            new = new_count,
                            "Market list changed, reconnecting all WebSockets"
                        );
                        for state in &self.conn_states {
                            state.force_close.notify_waiters();
                        }
                    }
                }
                Err(e) => {
                    // Keep the previous market set; try again next cycle.
                    error!(error = %e, "Market refresh failed");
                }
            }
        }
    }

    /// Periodic stats line and scanner_stats singleton update.
    async fn stats_loop(self: Arc<Self>) {
        while self.is_running() {
            sleep(STATS_INTERVAL).await;
            if !self.is_running() {
                break;
            }

            let stats = self.stats_snapshot();
            let conn_ages: Vec<String> = self
                .conn_states
                .iter()
                .map(|s| {
                    if s.is_connected() {
                        format!("{}s", s.seconds_silent())
                    } else {
                        "down".to_string()
                    }
                })
                .collect();
            let best_near_miss = self
                .detector
                .best_near_miss()
                .map(|b| format!("{}% ({})", b.profit * Decimal::ONE_HUNDRED, b.market));

            info!(
                markets = stats.markets,
                price_updates = stats.price_updates,
                arbitrage_alerts = stats.arbitrage_alerts,
                ws_connections = %stats.ws_connections,
                conn_ages = %conn_ages.join(","),
                best_spread = best_near_miss.as_deref().unwrap_or("none"),
                "Scanner stats"
            );

            self.sink.emit(SinkEvent::ScannerStats(stats));
        }
    }

    /// Current aggregate scanner statistics.
    pub fn stats_snapshot(&self) -> ScannerStats {
        let connected = self
            .conn_states
            .iter()
            .filter(|s| s.is_connected())
            .count();
        let total = self.conn_states.len();
        let subscribed: usize = self.conn_states.iter().map(|s| s.subscribed_count()).sum();

        ScannerStats {
            markets: self.current_registry().market_count() as i64,
            price_updates: self.price_updates.load(Ordering::Relaxed) as i64,
            arbitrage_alerts: self.arbitrage_alerts.load(Ordering::Relaxed) as i64,
            ws_connected: connected == total && total > 0,
            ws_connections: format!("{}/{}", connected, total),
            subscribed_tokens: subscribed as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("token-{}", i)).collect()
    }

    #[test]
    fn test_shard_slicing_exact() {
        let all = tokens(1200);

        let shard0 = shard_tokens(&all, 0);
        let shard1 = shard_tokens(&all, 1);
        let shard2 = shard_tokens(&all, 2);
        let shard3 = shard_tokens(&all, 3);

        assert_eq!(shard0.len(), 500);
        assert_eq!(shard1.len(), 500);
        assert_eq!(shard2.len(), 200);
        assert!(shard3.is_empty());

        assert_eq!(shard0[0], "token-0");
        assert_eq!(shard1[0], "token-500");
        assert_eq!(shard2[0], "token-1000");
    }

    #[test]
    fn test_each_asset_in_exactly_one_shard() {
        // With N connections and M markets, exactly min(2M, N*500) assets
        // are subscribed and each appears once.
        let markets = 700; // 1400 tokens
        let connections = 6;
        let all = tokens(markets * 2);

        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for conn_id in 0..connections {
            for token in shard_tokens(&all, conn_id) {
                assert!(seen.insert(token), "token subscribed twice");
                total += 1;
            }
        }

        assert_eq!(
            total,
            (markets * 2).min(connections * MAX_ASSETS_PER_CONNECTION)
        );
    }

    #[test]
    fn test_small_market_set_leaves_trailing_shards_empty() {
        let all = tokens(120);
        assert_eq!(shard_tokens(&all, 0).len(), 120);
        assert!(shard_tokens(&all, 1).is_empty());
        assert!(shard_tokens(&all, 5).is_empty());
    }

    #[test]
    fn test_conn_state_silence_tracking() {
        let state = ConnState::new();
        state.touch();
        assert!(state.seconds_silent() < 2);
        assert!(!state.is_connected());
    }
}
