//! Arbitrage detection on every top-of-book change.
//!
//! Runs inline on the stream task: no awaits, no I/O. Everything that has
//! to leave the hot path (persistence, notification, execution) is
//! returned to the caller as an outcome.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use common::models::{ArbAlert, Market, MarketPrices, Side};

use crate::registry::Registry;

/// Width of the near-miss diagnostic window below the profit threshold.
const NEAR_MISS_WINDOW: Decimal = Decimal::from_parts(5, 0, 0, false, 3); // 0.005

/// What a single update produced.
#[derive(Debug)]
pub enum DetectorOutcome {
    /// Nothing actionable.
    None,
    /// An opportunity just closed; backfill its alert duration.
    Closed {
        market: Arc<Market>,
        duration_secs: f64,
    },
    /// A qualifying opportunity. `newly_opened` is true exactly once per
    /// opportunity lifetime; the persisted alert is emitted only then.
    Opportunity {
        alert: ArbAlert,
        newly_opened: bool,
    },
}

/// Best near-miss seen since startup, for the periodic stats line.
#[derive(Debug, Clone)]
pub struct NearMissSummary {
    pub profit: Decimal,
    pub market: String,
}

pub struct Detector {
    threshold: Decimal,
    max_days_until_resolution: i64,
    /// market id -> first_seen for currently open opportunities.
    lifetimes: Mutex<HashMap<String, DateTime<Utc>>>,
    best_near_miss: Mutex<Option<NearMissSummary>>,
}

impl Detector {
    pub fn new(threshold: Decimal, max_days_until_resolution: i64) -> Self {
        Self {
            threshold,
            max_days_until_resolution,
            lifetimes: Mutex::new(HashMap::new()),
            best_near_miss: Mutex::new(None),
        }
    }

    /// Evaluate a market's post-update snapshot.
    pub fn on_update(
        &self,
        registry: &Registry,
        idx: usize,
        snapshot: &MarketPrices,
        now: DateTime<Utc>,
    ) -> DetectorOutcome {
        let market = registry.market(idx);

        let (Some(combined), Some(profit)) = (snapshot.combined_ask(), snapshot.profit()) else {
            return DetectorOutcome::None;
        };

        if profit <= Decimal::ZERO {
            return self.close_if_open(market, now);
        }

        if profit <= self.threshold {
            if profit > self.threshold - NEAR_MISS_WINDOW {
                debug!(
                    market = market.short_question(40),
                    profit = %profit,
                    threshold = %self.threshold,
                    combined = %combined,
                    "Near-miss arbitrage"
                );
                self.record_near_miss(market, profit);
            }
            return DetectorOutcome::None;
        }

        // Resolution horizon: markets resolving too far out are skipped;
        // an unknown resolution date is allowed.
        if let Some(days) = market.days_until_resolution(now) {
            if days > self.max_days_until_resolution {
                debug!(
                    market = market.short_question(30),
                    days_until = days,
                    max_days = self.max_days_until_resolution,
                    "Skipping arbitrage - resolution too far"
                );
                return DetectorOutcome::None;
            }
        }

        let (yes_size, no_size) = self.resolve_sizes(registry, idx, market, snapshot);

        let mut lifetimes = self.lifetimes.lock().expect("lifetime lock poisoned");
        let newly_opened = !lifetimes.contains_key(&market.id);
        let first_seen = *lifetimes.entry(market.id.clone()).or_insert(now);
        drop(lifetimes);

        let alert = ArbAlert {
            market: Arc::clone(market),
            yes_ask: snapshot.yes.best_ask.unwrap_or(Decimal::ZERO),
            no_ask: snapshot.no.best_ask.unwrap_or(Decimal::ZERO),
            combined_ask: combined,
            profit,
            yes_size,
            no_size,
            first_seen,
            detected_at: now,
        };

        DetectorOutcome::Opportunity { alert, newly_opened }
    }

    /// Ask sizes from the snapshot, falling back to the shared ladder cache
    /// when a side never carried one. A recovered size is written back so
    /// the next update starts warm. Missing stays zero; the executor's
    /// minimum-notional check decides what that means.
    fn resolve_sizes(
        &self,
        registry: &Registry,
        idx: usize,
        market: &Market,
        snapshot: &MarketPrices,
    ) -> (Decimal, Decimal) {
        let mut yes_size = snapshot.yes.ask_size_at_best;
        let mut no_size = snapshot.no.ask_size_at_best;

        if yes_size.is_none() {
            if let Some((_, size)) = registry.ladder_ask_size(&market.yes_token_id) {
                registry.set_ask_size(idx, Side::Yes, size);
                yes_size = Some(size);
            }
        }
        if no_size.is_none() {
            if let Some((_, size)) = registry.ladder_ask_size(&market.no_token_id) {
                registry.set_ask_size(idx, Side::No, size);
                no_size = Some(size);
            }
        }

        (
            yes_size.unwrap_or(Decimal::ZERO),
            no_size.unwrap_or(Decimal::ZERO),
        )
    }

    fn close_if_open(&self, market: &Arc<Market>, now: DateTime<Utc>) -> DetectorOutcome {
        let first_seen = {
            let mut lifetimes = self.lifetimes.lock().expect("lifetime lock poisoned");
            lifetimes.remove(&market.id)
        };

        match first_seen {
            Some(first_seen) => {
                let duration_secs =
                    (now - first_seen).num_milliseconds().max(0) as f64 / 1000.0;
                DetectorOutcome::Closed {
                    market: Arc::clone(market),
                    duration_secs,
                }
            }
            None => DetectorOutcome::None,
        }
    }

    fn record_near_miss(&self, market: &Market, profit: Decimal) {
        let mut best = self.best_near_miss.lock().expect("near-miss lock poisoned");
        let improved = best.as_ref().map(|b| profit > b.profit).unwrap_or(true);
        if improved {
            *best = Some(NearMissSummary {
                profit,
                market: market.short_question(40).to_string(),
            });
        }
    }

    /// Best near-miss since startup, for the stats line.
    pub fn best_near_miss(&self) -> Option<NearMissSummary> {
        self.best_near_miss
            .lock()
            .expect("near-miss lock poisoned")
            .clone()
    }

    /// Number of currently open opportunities.
    pub fn open_opportunities(&self) -> usize {
        self.lifetimes.lock().expect("lifetime lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use common::models::Market;

    fn market(id: &str) -> Market {
        Market {
            id: id.to_string(),
            question: format!("{} question", id),
            yes_token_id: format!("{}-yes", id),
            no_token_id: format!("{}-no", id),
            neg_risk: false,
            end_date: None,
            liquidity: dec!(50000),
        }
    }

    fn setup() -> (Registry, Detector) {
        let registry = Registry::new(vec![market("m1")]);
        let detector = Detector::new(dec!(0.005), 7);
        (registry, detector)
    }

    fn update(
        registry: &Registry,
        yes_ask: Decimal,
        no_ask: Decimal,
        size: Decimal,
    ) -> MarketPrices {
        registry.apply_update(0, Side::Yes, None, Some(yes_ask), Some(size));
        registry.apply_update(0, Side::No, None, Some(no_ask), Some(size))
    }

    #[test]
    fn test_opportunity_detected_above_threshold() {
        let (registry, detector) = setup();
        let snap = update(&registry, dec!(0.45), dec!(0.48), dec!(100));

        match detector.on_update(&registry, 0, &snap, Utc::now()) {
            DetectorOutcome::Opportunity { alert, newly_opened } => {
                assert!(newly_opened);
                assert_eq!(alert.combined_ask, dec!(0.93));
                assert_eq!(alert.profit, dec!(0.07));
                assert_eq!(alert.yes_size, dec!(100));
                assert_eq!(alert.no_size, dec!(100));
            }
            other => panic!("Expected Opportunity, got {:?}", other),
        }
    }

    #[test]
    fn test_no_alert_when_either_ask_missing() {
        let (registry, detector) = setup();
        let snap = registry.apply_update(0, Side::Yes, None, Some(dec!(0.30)), Some(dec!(100)));
        assert!(matches!(
            detector.on_update(&registry, 0, &snap, Utc::now()),
            DetectorOutcome::None
        ));
    }

    #[test]
    fn test_alert_emitted_once_per_opening() {
        let (registry, detector) = setup();
        let snap = update(&registry, dec!(0.45), dec!(0.48), dec!(100));

        let first = detector.on_update(&registry, 0, &snap, Utc::now());
        let second = detector.on_update(&registry, 0, &snap, Utc::now());

        match (first, second) {
            (
                DetectorOutcome::Opportunity { newly_opened: a, .. },
                DetectorOutcome::Opportunity { newly_opened: b, alert },
            ) => {
                assert!(a);
                assert!(!b);
                // first_seen is sticky across repeated detections
                assert!(alert.first_seen <= alert.detected_at);
            }
            other => panic!("Expected two opportunities, got {:?}", other),
        }
    }

    #[test]
    fn test_close_reports_duration_once() {
        let (registry, detector) = setup();
        let open = update(&registry, dec!(0.45), dec!(0.48), dec!(100));
        detector.on_update(&registry, 0, &open, Utc::now());
        assert_eq!(detector.open_opportunities(), 1);

        // YES rises, combined goes above $1
        let closed = update(&registry, dec!(0.55), dec!(0.48), dec!(100));
        match detector.on_update(&registry, 0, &closed, Utc::now()) {
            DetectorOutcome::Closed { duration_secs, .. } => {
                assert!(duration_secs >= 0.0);
            }
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert_eq!(detector.open_opportunities(), 0);

        // A second unprofitable update must not close again.
        assert!(matches!(
            detector.on_update(&registry, 0, &closed, Utc::now()),
            DetectorOutcome::None
        ));
    }

    #[test]
    fn test_near_miss_window_records_summary() {
        let (registry, detector) = setup();
        // profit = 0.003: below the 0.005 threshold, inside the 0.005 window
        let snap = update(&registry, dec!(0.497), dec!(0.50), dec!(100));

        assert!(matches!(
            detector.on_update(&registry, 0, &snap, Utc::now()),
            DetectorOutcome::None
        ));
        let best = detector.best_near_miss().expect("near miss recorded");
        assert_eq!(best.profit, dec!(0.003));
    }

    #[test]
    fn test_profit_exactly_at_threshold_is_not_an_alert() {
        let (registry, detector) = setup();
        // profit = 0.005 == threshold: strict inequality means no alert
        let snap = update(&registry, dec!(0.495), dec!(0.50), dec!(100));
        assert!(matches!(
            detector.on_update(&registry, 0, &snap, Utc::now()),
            DetectorOutcome::None
        ));
    }

    #[test]
    fn test_resolution_too_far_is_skipped() {
        let mut far_market = market("m1");
        far_market.end_date = Some(Utc::now() + chrono::Duration::days(30));
        let registry = Registry::new(vec![far_market]);
        let detector = Detector::new(dec!(0.005), 7);

        let snap = update(&registry, dec!(0.45), dec!(0.48), dec!(100));
        assert!(matches!(
            detector.on_update(&registry, 0, &snap, Utc::now()),
            DetectorOutcome::None
        ));
    }

    #[test]
    fn test_unknown_resolution_date_is_allowed() {
        let (registry, detector) = setup();
        let snap = update(&registry, dec!(0.45), dec!(0.48), dec!(100));
        assert!(matches!(
            detector.on_update(&registry, 0, &snap, Utc::now()),
            DetectorOutcome::Opportunity { .. }
        ));
    }

    #[test]
    fn test_missing_size_falls_back_to_ladder() {
        let (registry, detector) = setup();
        registry.replace_ladder(
            "m1-yes",
            vec![crate::registry::LadderLevel { price: dec!(0.45), size: dec!(80) }],
        );

        // Price-only updates: no carried sizes.
        registry.apply_update(0, Side::Yes, None, Some(dec!(0.45)), None);
        let snap = registry.apply_update(0, Side::No, None, Some(dec!(0.48)), None);

        match detector.on_update(&registry, 0, &snap, Utc::now()) {
            DetectorOutcome::Opportunity { alert, .. } => {
                assert_eq!(alert.yes_size, dec!(80));
                // NO side has no ladder either: stays zero for sizing to veto.
                assert_eq!(alert.no_size, dec!(0));
                // Recovered size was written back to the store.
                assert_eq!(
                    registry.snapshot(0).yes.ask_size_at_best,
                    Some(dec!(80))
                );
            }
            other => panic!("Expected Opportunity, got {:?}", other),
        }
    }
}
