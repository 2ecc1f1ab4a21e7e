//! Cached USDC balance with reservation semantics.
//!
//! One scalar guarded by one mutex. Reservations deduct synchronously with
//! the decision to trade; unwinding is always a refresh from chain, never a
//! blind credit, because a concurrent refresh may already reflect partial
//! fills.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error};

use common::chain::{positions_value, BalanceSource};
use common::models::PortfolioSnapshot;

pub struct BalanceCache {
    cached: Mutex<Decimal>,
    source: Arc<dyn BalanceSource>,
}

impl BalanceCache {
    pub fn new(source: Arc<dyn BalanceSource>) -> Self {
        Self {
            cached: Mutex::new(Decimal::ZERO),
            source,
        }
    }

    /// Current cached balance.
    pub async fn read(&self) -> Decimal {
        *self.cached.lock().await
    }

    /// Set the cache directly. Used to seed the simulated dry-run bankroll;
    /// live mode only ever refreshes from chain.
    pub async fn seed(&self, amount: Decimal) {
        *self.cached.lock().await = amount;
    }

    /// Deduct `cost` if the cache still covers it. The caller holds the
    /// execution lock, so a false return means the cache moved underneath a
    /// stale sizing decision; the caller records a near-miss and walks away.
    pub async fn reserve(&self, cost: Decimal) -> bool {
        let mut cached = self.cached.lock().await;
        if *cached >= cost {
            *cached -= cost;
            true
        } else {
            false
        }
    }

    /// Replace the cache from on-chain truth. Returns the new balance and a
    /// portfolio snapshot for the historical series. On RPC failure the
    /// stale value is kept and returned; the next tick retries.
    pub async fn refresh(&self) -> Result<(Decimal, PortfolioSnapshot)> {
        let balance = match self.source.usdc_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                error!(error = %e, "Balance refresh failed, keeping cached value");
                let stale = *self.cached.lock().await;
                return Ok((
                    stale,
                    PortfolioSnapshot {
                        timestamp: Utc::now(),
                        polymarket_usdc: stale,
                        total_usd: stale,
                        positions_value: Decimal::ZERO,
                    },
                ));
            }
        };

        {
            let mut cached = self.cached.lock().await;
            *cached = balance;
        }

        // Positions value is best-effort; the cache itself is already fresh.
        let positions_total = match self.source.positions().await {
            Ok(positions) => positions_value(&positions),
            Err(e) => {
                debug!(error = %e, "Failed to fetch positions for snapshot");
                Decimal::ZERO
            }
        };

        debug!(balance = %balance, positions = %positions_total, "Balance refreshed");

        Ok((
            balance,
            PortfolioSnapshot {
                timestamp: Utc::now(),
                polymarket_usdc: balance,
                total_usd: balance + positions_total,
                positions_value: positions_total,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use common::chain::{ChainError, MockBalanceSource, PositionData};

    fn cache_with_balance(balance: Decimal) -> BalanceCache {
        let mut mock = MockBalanceSource::new();
        mock.expect_usdc_balance().returning(move || Ok(balance));
        mock.expect_positions().returning(|| Ok(vec![]));
        BalanceCache::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn test_reserve_deducts_on_success() {
        let cache = cache_with_balance(dec!(100));
        cache.refresh().await.unwrap();

        assert!(cache.reserve(dec!(46.50)).await);
        assert_eq!(cache.read().await, dec!(53.50));
    }

    #[tokio::test]
    async fn test_reserve_fails_without_deducting() {
        let cache = cache_with_balance(dec!(10));
        cache.refresh().await.unwrap();

        assert!(!cache.reserve(dec!(46.50)).await);
        assert_eq!(cache.read().await, dec!(10));
    }

    #[tokio::test]
    async fn test_balance_never_goes_negative() {
        let cache = cache_with_balance(dec!(50));
        cache.refresh().await.unwrap();

        assert!(cache.reserve(dec!(50)).await);
        assert_eq!(cache.read().await, dec!(0));
        assert!(!cache.reserve(dec!(0.01)).await);
        assert_eq!(cache.read().await, dec!(0));
    }

    #[tokio::test]
    async fn test_refresh_replaces_not_increments() {
        let cache = cache_with_balance(dec!(100));
        cache.refresh().await.unwrap();
        cache.reserve(dec!(40)).await;

        // Chain still says 100 (orders not yet settled): cache goes back to
        // chain truth, it does not add the reservation back on top.
        cache.refresh().await.unwrap();
        assert_eq!(cache.read().await, dec!(100));
    }

    #[tokio::test]
    async fn test_refresh_keeps_stale_value_on_rpc_failure() {
        let mut mock = MockBalanceSource::new();
        let mut calls = 0;
        mock.expect_usdc_balance().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(dec!(75))
            } else {
                Err(ChainError::Rpc("node down".to_string()))
            }
        });
        mock.expect_positions().returning(|| Ok(vec![]));

        let cache = BalanceCache::new(Arc::new(mock));
        cache.refresh().await.unwrap();
        assert_eq!(cache.read().await, dec!(75));

        let (balance, _) = cache.refresh().await.unwrap();
        assert_eq!(balance, dec!(75));
        assert_eq!(cache.read().await, dec!(75));
    }

    #[tokio::test]
    async fn test_refresh_snapshot_includes_positions_value() {
        let mut mock = MockBalanceSource::new();
        mock.expect_usdc_balance().returning(|| Ok(dec!(100)));
        mock.expect_positions().returning(|| {
            Ok(vec![PositionData {
                asset: "t1".into(),
                size: 10.0,
                cur_price: Some(0.5),
                avg_price: None,
                redeemable: None,
            }])
        });

        let cache = BalanceCache::new(Arc::new(mock));
        let (_, snapshot) = cache.refresh().await.unwrap();
        assert_eq!(snapshot.polymarket_usdc, dec!(100));
        assert_eq!(snapshot.positions_value, dec!(5.0));
        assert_eq!(snapshot.total_usd, dec!(105.0));
    }
}
