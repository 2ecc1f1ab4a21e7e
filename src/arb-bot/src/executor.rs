//! Order execution: sizing, dual submission, outcome classification.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use common::clob_api::ClobApiClient;
use common::models::{
    ArbAlert, ExecutionReport, ExecutionStatus, NearMissReason, OrderResult,
};
use common::signing::{OrderData, OrderSigner};

/// Fraction of visible liquidity actually used. Liquidity decays during the
/// 1-20s an execution can take, and other bots race the same opportunity.
const LIQUIDITY_SAFETY_MARGIN: Decimal = dec!(0.50);

/// Exchange minimum order value is $1.00; buffered 10% against price drift.
const MIN_ORDER_VALUE: Decimal = dec!(1.10);

/// Absolute floor on shares per order.
const MIN_SHARES_FLOOR: Decimal = dec!(5);

/// Result of the sizing pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizingOutcome {
    /// Proceed: reserve `required_cost` and submit two orders of
    /// `trade_size` shares.
    Sized {
        trade_size: Decimal,
        required_cost: Decimal,
        min_shares: Decimal,
    },
    /// Pre-submit guard failed; record and walk away.
    NearMiss {
        reason: NearMissReason,
        min_required: Decimal,
    },
}

/// Size an opportunity against liquidity, the position cap, and the cached
/// balance. Pure so the arithmetic is testable in isolation; the caller
/// holds the execution lock and reads the balance under it.
pub fn size_opportunity(
    alert: &ArbAlert,
    max_position_usd: Decimal,
    cached_balance: Decimal,
) -> SizingOutcome {
    let raw_available = alert.yes_size.min(alert.no_size);
    let available = (raw_available * LIQUIDITY_SAFETY_MARGIN)
        .round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity);

    // Both orders must clear the exchange minimum notional.
    let min_for_yes = ceil_div(MIN_ORDER_VALUE, alert.yes_ask);
    let min_for_no = ceil_div(MIN_ORDER_VALUE, alert.no_ask);
    let min_shares = min_for_yes.max(min_for_no).max(MIN_SHARES_FLOOR);

    if available < min_shares {
        return SizingOutcome::NearMiss {
            reason: NearMissReason::InsufficientLiquidity,
            min_required: min_shares,
        };
    }

    let position_cap = (max_position_usd / alert.combined_ask)
        .round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity);
    let mut trade_size = available.min(position_cap);
    let mut required = trade_size * alert.combined_ask;

    if cached_balance < required {
        if cached_balance >= min_shares * alert.combined_ask {
            trade_size = (cached_balance / alert.combined_ask)
                .round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity);
            required = trade_size * alert.combined_ask;
        } else {
            return SizingOutcome::NearMiss {
                reason: NearMissReason::InsufficientBalance {
                    required,
                    available: cached_balance,
                },
                min_required: required,
            };
        }
    }

    SizingOutcome::Sized {
        trade_size,
        required_cost: required,
        min_shares,
    }
}

fn ceil_div(value: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::MAX;
    }
    (value / price).round_dp_with_strategy(0, RoundingStrategy::ToPositiveInfinity)
}

/// neg_risk flags keyed by token id, prefetched when the market set loads
/// so the hot path never pays the lookup.
#[derive(Default)]
pub struct NegRiskCache {
    map: RwLock<HashMap<String, bool>>,
}

impl NegRiskCache {
    pub async fn get(&self, token_id: &str) -> Option<bool> {
        self.map.read().await.get(token_id).copied()
    }

    pub async fn insert(&self, token_id: String, neg_risk: bool) {
        self.map.write().await.insert(token_id, neg_risk);
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    /// Fetch and cache flags for every token, with the market metadata
    /// value as the fallback when the lookup fails.
    pub async fn prefetch(
        &self,
        api: &ClobApiClient,
        tokens: Vec<(String, bool)>,
    ) {
        let total = tokens.len();
        let results: Vec<(String, bool)> = stream::iter(tokens)
            .map(|(token_id, fallback)| async move {
                match api.get_neg_risk(&token_id).await {
                    Ok(flag) => (token_id, flag),
                    Err(_) => (token_id, fallback),
                }
            })
            .buffer_unordered(16)
            .collect()
            .await;

        let mut map = self.map.write().await;
        for (token_id, flag) in results {
            map.insert(token_id, flag);
        }
        info!(count = total, "neg_risk flags prefetched");
    }
}

/// Executor: converts a sized opportunity into two signed GTC buys.
pub struct Executor {
    api: Arc<ClobApiClient>,
    signer: Option<OrderSigner>,
    neg_risk: Arc<NegRiskCache>,
    dry_run: bool,
}

impl Executor {
    pub fn new(
        api: Arc<ClobApiClient>,
        signer: Option<OrderSigner>,
        neg_risk: Arc<NegRiskCache>,
        dry_run: bool,
    ) -> Self {
        Self {
            api,
            signer,
            neg_risk,
            dry_run,
        }
    }

    /// Submit both legs for a sized opportunity and classify the outcome.
    pub async fn execute(
        &self,
        alert: &ArbAlert,
        trade_size: Decimal,
        required_cost: Decimal,
    ) -> Result<ExecutionReport> {
        if self.dry_run {
            info!(
                market = alert.market.short_question(40),
                trade_size = %trade_size,
                cost = %required_cost,
                profit = %(trade_size * alert.profit),
                "[DRY RUN] simulated dual order"
            );
            return Ok(self.report(
                alert,
                trade_size,
                required_cost,
                OrderResult {
                    order_id: None,
                    status: "dry_run".to_string(),
                    filled_size: trade_size,
                    error: None,
                },
                OrderResult {
                    order_id: None,
                    status: "dry_run".to_string(),
                    filled_size: trade_size,
                    error: None,
                },
                ExecutionStatus::Filled,
            ));
        }

        let signer = self
            .signer
            .as_ref()
            .context("Live execution requires a configured signer")?;

        // One market, one flag: the lookup only suspends on a prefetch miss.
        let neg_risk = match self.neg_risk.get(&alert.market.yes_token_id).await {
            Some(flag) => flag,
            None => self
                .api
                .get_neg_risk(&alert.market.yes_token_id)
                .await
                .unwrap_or(alert.market.neg_risk),
        };

        let yes_order = OrderData::gtc_buy(
            signer.address(),
            &alert.market.yes_token_id,
            alert.yes_ask,
            trade_size,
        )
        .context("Failed to build YES order")?;
        let no_order = OrderData::gtc_buy(
            signer.address(),
            &alert.market.no_token_id,
            alert.no_ask,
            trade_size,
        )
        .context("Failed to build NO order")?;

        // Both signatures before either submission hits the wire.
        let yes_signed = signer.sign_order(&yes_order, neg_risk).await?;
        let no_signed = signer.sign_order(&no_order, neg_risk).await?;

        let (yes_result, no_result) = tokio::join!(
            self.api.post_order(&yes_signed),
            self.api.post_order(&no_signed),
        );

        let yes = yes_result.unwrap_or_else(|e| transport_failure(e.to_string()));
        let no = no_result.unwrap_or_else(|e| transport_failure(e.to_string()));

        let status = classify(&yes, &no);
        match status {
            ExecutionStatus::Filled => info!(
                market = alert.market.short_question(40),
                trade_size = %trade_size,
                cost = %required_cost,
                "Dual order placed"
            ),
            ExecutionStatus::Partial => error!(
                market = alert.market.short_question(40),
                yes_ok = yes.succeeded(),
                no_ok = no.succeeded(),
                yes_error = yes.error.as_deref().unwrap_or(""),
                no_error = no.error.as_deref().unwrap_or(""),
                "PARTIAL EXECUTION - position is one-sided"
            ),
            ExecutionStatus::Failed => warn!(
                market = alert.market.short_question(40),
                yes_error = yes.error.as_deref().unwrap_or(""),
                no_error = no.error.as_deref().unwrap_or(""),
                "Both orders failed"
            ),
        }

        Ok(self.report(alert, trade_size, required_cost, yes, no, status))
    }

    fn report(
        &self,
        alert: &ArbAlert,
        trade_size: Decimal,
        required_cost: Decimal,
        yes: OrderResult,
        no: OrderResult,
        status: ExecutionStatus,
    ) -> ExecutionReport {
        let expected_profit = if status == ExecutionStatus::Filled {
            trade_size * alert.profit
        } else {
            Decimal::ZERO
        };

        ExecutionReport {
            status,
            trade_size,
            total_cost: required_cost,
            expected_profit,
            yes_price: alert.yes_ask,
            no_price: alert.no_ask,
            yes,
            no,
        }
    }
}

fn transport_failure(error: String) -> OrderResult {
    OrderResult {
        order_id: None,
        status: "transport_error".to_string(),
        filled_size: Decimal::ZERO,
        error: Some(error),
    }
}

/// FILLED / PARTIAL / FAILED from the two per-order results.
pub fn classify(yes: &OrderResult, no: &OrderResult) -> ExecutionStatus {
    match (yes.succeeded(), no.succeeded()) {
        (true, true) => ExecutionStatus::Filled,
        (false, false) => ExecutionStatus::Failed,
        _ => ExecutionStatus::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use common::models::Market;

    fn alert(
        yes_ask: Decimal,
        no_ask: Decimal,
        yes_size: Decimal,
        no_size: Decimal,
    ) -> ArbAlert {
        let now = Utc::now();
        ArbAlert {
            market: Arc::new(Market {
                id: "c1".to_string(),
                question: "Test?".to_string(),
                yes_token_id: "y".to_string(),
                no_token_id: "n".to_string(),
                neg_risk: false,
                end_date: None,
                liquidity: dec!(50000),
            }),
            yes_ask,
            no_ask,
            combined_ask: yes_ask + no_ask,
            profit: Decimal::ONE - (yes_ask + no_ask),
            yes_size,
            no_size,
            first_seen: now,
            detected_at: now,
        }
    }

    #[test]
    fn test_sizing_happy_path() {
        // Scenario: yes 0.45, no 0.48, both sizes 100, balance ample.
        let alert = alert(dec!(0.45), dec!(0.48), dec!(100), dec!(100));
        match size_opportunity(&alert, dec!(100), dec!(1000)) {
            SizingOutcome::Sized {
                trade_size,
                required_cost,
                ..
            } => {
                assert_eq!(trade_size, dec!(50)); // floor(min(100,100) * 0.5)
                assert_eq!(required_cost, dec!(46.50)); // 50 * 0.93
            }
            other => panic!("Expected Sized, got {:?}", other),
        }
    }

    #[test]
    fn test_sizing_thin_liquidity_is_near_miss() {
        // yes 0.40, no 0.55, sizes 3/3: available floor(1.5) = 1 < min_shares
        let alert = alert(dec!(0.40), dec!(0.55), dec!(3), dec!(3));
        match size_opportunity(&alert, dec!(100), dec!(1000)) {
            SizingOutcome::NearMiss {
                reason,
                min_required,
            } => {
                assert_eq!(reason, NearMissReason::InsufficientLiquidity);
                // max(ceil(1.10/0.40)=3, ceil(1.10/0.55)=2, 5) = 5
                assert_eq!(min_required, dec!(5));
            }
            other => panic!("Expected NearMiss, got {:?}", other),
        }
    }

    #[test]
    fn test_sizing_shrinks_to_balance() {
        // Balance $20 cannot cover 50 shares at 0.93; shrink to floor(20/0.93) = 21.
        let alert = alert(dec!(0.45), dec!(0.48), dec!(100), dec!(100));
        match size_opportunity(&alert, dec!(100), dec!(20)) {
            SizingOutcome::Sized {
                trade_size,
                required_cost,
                ..
            } => {
                assert_eq!(trade_size, dec!(21));
                assert_eq!(required_cost, dec!(19.53));
            }
            other => panic!("Expected Sized, got {:?}", other),
        }
    }

    #[test]
    fn test_sizing_insufficient_balance_is_near_miss() {
        // Balance cannot even cover the minimum share count.
        let alert = alert(dec!(0.45), dec!(0.48), dec!(100), dec!(100));
        match size_opportunity(&alert, dec!(100), dec!(2)) {
            SizingOutcome::NearMiss {
                reason:
                    NearMissReason::InsufficientBalance {
                        required,
                        available,
                    },
                ..
            } => {
                assert_eq!(required, dec!(46.50));
                assert_eq!(available, dec!(2));
            }
            other => panic!("Expected InsufficientBalance, got {:?}", other),
        }
    }

    #[test]
    fn test_sizing_respects_position_cap() {
        let alert = alert(dec!(0.45), dec!(0.48), dec!(1000), dec!(1000));
        match size_opportunity(&alert, dec!(100), dec!(10000)) {
            SizingOutcome::Sized { trade_size, .. } => {
                // available = 500, cap = floor(100/0.93) = 107
                assert_eq!(trade_size, dec!(107));
            }
            other => panic!("Expected Sized, got {:?}", other),
        }
    }

    #[test]
    fn test_min_shares_driven_by_cheaper_side() {
        // yes at 0.05 needs ceil(1.10/0.05) = 22 shares for the $1 minimum.
        let alert = alert(dec!(0.05), dec!(0.90), dec!(30), dec!(30));
        match size_opportunity(&alert, dec!(100), dec!(1000)) {
            SizingOutcome::NearMiss { min_required, .. } => {
                // available = 15 < 22
                assert_eq!(min_required, dec!(22));
            }
            other => panic!("Expected NearMiss, got {:?}", other),
        }
    }

    #[test]
    fn test_sizing_zero_size_when_unknown() {
        // A side with no size information stays 0 and vetoes execution.
        let alert = alert(dec!(0.45), dec!(0.48), dec!(0), dec!(100));
        assert!(matches!(
            size_opportunity(&alert, dec!(100), dec!(1000)),
            SizingOutcome::NearMiss {
                reason: NearMissReason::InsufficientLiquidity,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_matrix() {
        let ok = OrderResult {
            order_id: Some("0x1".into()),
            status: "live".into(),
            filled_size: dec!(10),
            error: None,
        };
        let failed = OrderResult {
            order_id: None,
            status: "rejected".into(),
            filled_size: dec!(0),
            error: Some("nope".into()),
        };

        assert_eq!(classify(&ok, &ok), ExecutionStatus::Filled);
        assert_eq!(classify(&ok, &failed), ExecutionStatus::Partial);
        assert_eq!(classify(&failed, &ok), ExecutionStatus::Partial);
        assert_eq!(classify(&failed, &failed), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_dry_run_reports_filled_without_submitting() {
        let api = Arc::new(
            ClobApiClient::new("http://127.0.0.1:1", None, None, None).unwrap(),
        );
        let executor = Executor::new(api, None, Arc::new(NegRiskCache::default()), true);

        let alert = alert(dec!(0.45), dec!(0.48), dec!(100), dec!(100));
        let report = executor.execute(&alert, dec!(50), dec!(46.50)).await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Filled);
        assert_eq!(report.expected_profit, dec!(3.50)); // 50 * 0.07
        assert_eq!(report.yes.status, "dry_run");
    }

    #[tokio::test]
    async fn test_neg_risk_cache_roundtrip() {
        let cache = NegRiskCache::default();
        assert_eq!(cache.get("t1").await, None);
        cache.insert("t1".to_string(), true).await;
        assert_eq!(cache.get("t1").await, Some(true));
        assert_eq!(cache.len().await, 1);
    }
}
