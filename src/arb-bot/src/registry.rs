//! Market registry: arena of markets, token index, top-of-book store,
//! and the shared ladder cache.
//!
//! Markets live in a flat arena and are addressed by index; tokens map to
//! `(index, side)` through one lookup table, so there are no owning
//! back-references between tokens and markets. Each market's two-sided
//! top-of-book sits behind its own mutex, which is what gives the detector
//! and executor a consistent `(yes_ask, no_ask, yes_size, no_size)` tuple.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use rust_decimal::Decimal;

use common::models::{Market, MarketPrices, Side};

/// One resting ask level in the cached ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Registry over one loaded market set. Replaced wholesale on metadata
/// refresh; stream connections pick up the new instance when they
/// (re)subscribe.
pub struct Registry {
    markets: Vec<Arc<Market>>,
    token_index: HashMap<String, (usize, Side)>,
    prices: Vec<Mutex<MarketPrices>>,
    /// Ask ladders keyed by asset id, shared across all shards. Any shard
    /// (and the detector's size fallback) reads through this one index.
    ladders: Mutex<HashMap<String, Vec<LadderLevel>>>,
}

impl Registry {
    pub fn new(markets: Vec<Market>) -> Self {
        let markets: Vec<Arc<Market>> = markets.into_iter().map(Arc::new).collect();
        let mut token_index = HashMap::with_capacity(markets.len() * 2);
        for (idx, market) in markets.iter().enumerate() {
            token_index.insert(market.yes_token_id.clone(), (idx, Side::Yes));
            token_index.insert(market.no_token_id.clone(), (idx, Side::No));
        }
        let prices = markets.iter().map(|_| Mutex::new(MarketPrices::default())).collect();

        Self {
            markets,
            token_index,
            prices,
            ladders: Mutex::new(HashMap::new()),
        }
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn markets(&self) -> &[Arc<Market>] {
        &self.markets
    }

    pub fn market(&self, idx: usize) -> &Arc<Market> {
        &self.markets[idx]
    }

    /// Ordered token list: YES then NO for each market, in arena order.
    /// Sharding slices this list.
    pub fn token_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.markets.len() * 2);
        for market in &self.markets {
            ids.push(market.yes_token_id.clone());
            ids.push(market.no_token_id.clone());
        }
        ids
    }

    pub fn lookup_token(&self, token_id: &str) -> Option<(usize, Side)> {
        self.token_index.get(token_id).copied()
    }

    /// Apply a top-of-book update for one side of a market and return the
    /// post-update snapshot. Bid and ask are always replaced; the ask size
    /// is only replaced when the update actually carried one.
    pub fn apply_update(
        &self,
        idx: usize,
        side: Side,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        ask_size: Option<Decimal>,
    ) -> MarketPrices {
        let mut prices = self.prices[idx].lock().expect("price lock poisoned");
        let tob = prices.side_mut(side);
        tob.best_bid = best_bid;
        tob.best_ask = best_ask;
        if ask_size.is_some() {
            tob.ask_size_at_best = ask_size;
        }
        tob.revision += 1;
        prices.clone()
    }

    /// Cache an ask size discovered through the ladder fallback.
    pub fn set_ask_size(&self, idx: usize, side: Side, size: Decimal) {
        let mut prices = self.prices[idx].lock().expect("price lock poisoned");
        let tob = prices.side_mut(side);
        tob.ask_size_at_best = Some(size);
        tob.revision += 1;
    }

    /// Consistent snapshot of a market's two-sided top of book.
    pub fn snapshot(&self, idx: usize) -> MarketPrices {
        self.prices[idx].lock().expect("price lock poisoned").clone()
    }

    /// Replace the cached ask ladder for an asset (book snapshot).
    pub fn replace_ladder(&self, asset_id: &str, asks: Vec<LadderLevel>) {
        self.ladders
            .lock()
            .expect("ladder lock poisoned")
            .insert(asset_id.to_string(), asks);
    }

    /// Apply an incremental SELL-side level change to the cached ladder.
    /// Size zero removes the level.
    pub fn apply_ladder_change(&self, asset_id: &str, price: Decimal, size: Decimal) {
        let mut ladders = self.ladders.lock().expect("ladder lock poisoned");
        let asks = ladders.entry(asset_id.to_string()).or_default();
        if size.is_zero() {
            asks.retain(|l| l.price != price);
        } else if let Some(level) = asks.iter_mut().find(|l| l.price == price) {
            level.size = size;
        } else {
            asks.push(LadderLevel { price, size });
        }
    }

    /// Size resting at the lowest cached ask for an asset.
    pub fn ladder_ask_size(&self, asset_id: &str) -> Option<(Decimal, Decimal)> {
        let ladders = self.ladders.lock().expect("ladder lock poisoned");
        let asks = ladders.get(asset_id)?;
        let best = asks.iter().map(|l| l.price).min()?;
        let size = asks.iter().find(|l| l.price == best)?.size;
        Some((best, size))
    }
}
