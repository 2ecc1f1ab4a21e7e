//! Shared data models for markets, books, and persisted records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

/// A binary prediction market. Immutable within a refresh cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Stable market identifier (condition id).
    pub id: String,
    /// Market question text.
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Selects which exchange contract clears this market's orders.
    pub neg_risk: bool,
    /// Scheduled resolution time, if known.
    pub end_date: Option<DateTime<Utc>>,
    /// Liquidity figure used only for candidate selection.
    pub liquidity: Decimal,
}

impl Market {
    /// Whole days until resolution, normalised to UTC. None when the
    /// resolution date is unknown.
    pub fn days_until_resolution(&self, now: DateTime<Utc>) -> Option<i64> {
        self.end_date.map(|end| (end - now).num_days())
    }

    /// Question text truncated for log lines and record keys.
    pub fn short_question(&self, max: usize) -> &str {
        let end = self
            .question
            .char_indices()
            .nth(max)
            .map_or(self.question.len(), |(i, _)| i);
        &self.question[..end]
    }
}

/// Top-of-book state for a single token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopOfBook {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub ask_size_at_best: Option<Decimal>,
    /// Advances on every store mutation.
    pub revision: u64,
}

/// Joined top-of-book state for a market's YES and NO tokens.
#[derive(Debug, Clone, Default)]
pub struct MarketPrices {
    pub yes: TopOfBook,
    pub no: TopOfBook,
}

impl MarketPrices {
    /// Cost to buy both YES and NO at best ask.
    pub fn combined_ask(&self) -> Option<Decimal> {
        Some(self.yes.best_ask? + self.no.best_ask?)
    }

    /// Profit from buying both sides (1 - combined_ask).
    pub fn profit(&self) -> Option<Decimal> {
        Some(Decimal::ONE - self.combined_ask()?)
    }

    /// True when the profit exceeds the configured threshold.
    pub fn has_arbitrage(&self, threshold: Decimal) -> bool {
        self.profit().map(|p| p > threshold).unwrap_or(false)
    }

    pub fn side_mut(&mut self, side: Side) -> &mut TopOfBook {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }
}

/// A detected arbitrage opportunity, passed from detector to orchestrator.
#[derive(Debug, Clone)]
pub struct ArbAlert {
    pub market: Arc<Market>,
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    pub combined_ask: Decimal,
    pub profit: Decimal,
    /// Shares available at best ask on each side (0 when unknown).
    pub yes_size: Decimal,
    pub no_size: Decimal,
    /// When this opportunity first opened.
    pub first_seen: DateTime<Utc>,
    /// When this particular update was detected.
    pub detected_at: DateTime<Utc>,
}

/// Why an opportunity was not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NearMissReason {
    InsufficientLiquidity,
    InsufficientBalance { required: Decimal, available: Decimal },
}

impl NearMissReason {
    /// Reason string for the persisted near-miss record.
    pub fn as_record_str(&self) -> String {
        match self {
            NearMissReason::InsufficientLiquidity => "insufficient_liquidity".to_string(),
            NearMissReason::InsufficientBalance {
                required,
                available,
            } => format!(
                "insufficient_balance (need ${:.2}, have ${:.2})",
                required, available
            ),
        }
    }
}

/// Aggregate outcome of a dual-order submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Both orders placed.
    Filled,
    /// Exactly one order placed; position is imbalanced.
    Partial,
    /// Neither order placed.
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Filled => "FILLED",
            ExecutionStatus::Partial => "PARTIAL",
            ExecutionStatus::Failed => "FAILED",
        }
    }
}

/// Per-order result from the CLOB.
#[derive(Debug, Clone, Default)]
pub struct OrderResult {
    pub order_id: Option<String>,
    pub status: String,
    pub filled_size: Decimal,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn succeeded(&self) -> bool {
        self.order_id.is_some() && self.error.is_none()
    }
}

/// Result of executing one opportunity.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub trade_size: Decimal,
    pub total_cost: Decimal,
    pub expected_profit: Decimal,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub yes: OrderResult,
    pub no: OrderResult,
}

/// Persisted arbitrage alert (table `alerts`).
#[derive(Debug, Clone, FromRow)]
pub struct AlertRecord {
    pub market: String,
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    pub combined: Decimal,
    pub profit: Decimal,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub days_until_resolution: Option<i64>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub first_seen: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

/// Persisted near-miss alert (table `near_miss_alerts`).
#[derive(Debug, Clone, FromRow)]
pub struct NearMissRecord {
    pub timestamp: DateTime<Utc>,
    pub market: String,
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    pub combined: Decimal,
    pub profit_pct: Decimal,
    pub yes_liquidity: Decimal,
    pub no_liquidity: Decimal,
    pub min_required: Decimal,
    pub reason: String,
}

/// Persisted execution outcome (table `executions`).
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub market: String,
    pub status: String,
    pub yes_order_id: Option<String>,
    pub yes_status: Option<String>,
    pub yes_price: Decimal,
    pub yes_size: Decimal,
    pub yes_filled_size: Decimal,
    pub no_order_id: Option<String>,
    pub no_status: Option<String>,
    pub no_price: Decimal,
    pub no_size: Decimal,
    pub no_filled_size: Decimal,
    pub total_cost: Decimal,
    pub expected_profit: Decimal,
}

/// Balance snapshot for the portfolio time series (table `portfolio_snapshots`).
#[derive(Debug, Clone, FromRow)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub polymarket_usdc: Decimal,
    pub total_usd: Decimal,
    pub positions_value: Decimal,
}

/// Live scanner state (singleton row, table `scanner_stats`).
#[derive(Debug, Clone, Default)]
pub struct ScannerStats {
    pub markets: i64,
    pub price_updates: i64,
    pub arbitrage_alerts: i64,
    pub ws_connected: bool,
    /// "connected/total", e.g. "5/6".
    pub ws_connections: String,
    pub subscribed_tokens: i64,
}

/// Hourly stats snapshot (table `stats_history`).
#[derive(Debug, Clone, FromRow)]
pub struct StatsHistoryRow {
    pub timestamp: DateTime<Utc>,
    pub hour: String,
    pub markets: i64,
    pub price_updates: i64,
    pub arbitrage_alerts: i64,
    pub executions_attempted: i64,
    pub executions_filled: i64,
    pub ws_connected: bool,
}

/// Minute-grained price-update delta (table `minute_stats`).
#[derive(Debug, Clone, FromRow)]
pub struct MinuteStatsRow {
    pub timestamp: DateTime<Utc>,
    pub minute: String,
    pub price_updates: i64,
    pub ws_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices(yes_ask: Option<Decimal>, no_ask: Option<Decimal>) -> MarketPrices {
        MarketPrices {
            yes: TopOfBook {
                best_ask: yes_ask,
                ..Default::default()
            },
            no: TopOfBook {
                best_ask: no_ask,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_combined_ask_requires_both_sides() {
        assert_eq!(prices(Some(dec!(0.45)), None).combined_ask(), None);
        assert_eq!(prices(None, Some(dec!(0.50))).combined_ask(), None);
        assert_eq!(
            prices(Some(dec!(0.45)), Some(dec!(0.48))).combined_ask(),
            Some(dec!(0.93))
        );
    }

    #[test]
    fn test_profit_is_one_minus_combined() {
        let p = prices(Some(dec!(0.45)), Some(dec!(0.48)));
        assert_eq!(p.profit(), Some(dec!(0.07)));
    }

    #[test]
    fn test_has_arbitrage_respects_threshold() {
        let p = prices(Some(dec!(0.49)), Some(dec!(0.50)));
        // profit = 0.01
        assert!(p.has_arbitrage(dec!(0.005)));
        assert!(!p.has_arbitrage(dec!(0.01))); // strict inequality
        assert!(!p.has_arbitrage(dec!(0.02)));
    }

    #[test]
    fn test_has_arbitrage_false_when_side_missing() {
        let p = prices(Some(dec!(0.30)), None);
        assert!(!p.has_arbitrage(dec!(0.005)));
    }

    #[test]
    fn test_days_until_resolution_none_when_unknown() {
        let market = Market {
            id: "c1".to_string(),
            question: "Will it rain?".to_string(),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            neg_risk: false,
            end_date: None,
            liquidity: dec!(0),
        };
        assert_eq!(market.days_until_resolution(Utc::now()), None);
    }

    #[test]
    fn test_near_miss_reason_record_str() {
        assert_eq!(
            NearMissReason::InsufficientLiquidity.as_record_str(),
            "insufficient_liquidity"
        );
        let reason = NearMissReason::InsufficientBalance {
            required: dec!(46.50),
            available: dec!(20),
        };
        assert_eq!(
            reason.as_record_str(),
            "insufficient_balance (need $46.50, have $20.00)"
        );
    }

    #[test]
    fn test_short_question_utf8_safe() {
        let market = Market {
            id: "c1".to_string(),
            question: "Will é happen".to_string(),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            neg_risk: false,
            end_date: None,
            liquidity: dec!(0),
        };
        assert_eq!(market.short_question(6), "Will é");
        assert_eq!(market.short_question(100), "Will é happen");
    }
}
