//! Slack webhook notifications for operator-facing events.

use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, warn};

/// Operator notification sink. A missing webhook URL disables delivery
/// without changing any call site.
pub struct Notifier {
    client: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            webhook_url,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Deliver a plain text message. Failures are logged, never propagated:
    /// notification loss must not affect trading.
    pub async fn send_message(&self, text: &str) {
        let Some(url) = self.webhook_url.as_deref() else {
            return;
        };

        let payload = json!({ "text": text });
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "Notification rejected");
            }
            Err(e) => {
                warn!(error = %e, "Notification delivery failed");
            }
        }
    }

    pub async fn notify_startup(&self, mode: &str) {
        self.send_message(&format!("Arbitrage bot started [{}]", mode))
            .await;
    }

    pub async fn notify_shutdown(&self, reason: &str) {
        self.send_message(&format!("Arbitrage bot shutting down ({})", reason))
            .await;
    }

    pub async fn notify_arbitrage(
        &self,
        market: &str,
        yes_ask: Decimal,
        no_ask: Decimal,
        combined: Decimal,
        profit: Decimal,
    ) {
        self.send_message(&format!(
            "Arbitrage: {} | YES ${:.4} + NO ${:.4} = ${:.4} | profit {:.2}%",
            market,
            yes_ask,
            no_ask,
            combined,
            profit * Decimal::ONE_HUNDRED,
        ))
        .await;
    }

    /// Loud warning for an imbalanced position: one leg filled, one failed.
    pub async fn notify_partial_fill(&self, market: &str, filled_side: &str, failed_side: &str) {
        self.send_message(&format!(
            ":warning: PARTIAL FILL on {} | {} filled, {} failed - position is one-sided",
            market, filled_side, failed_side
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_notifier_is_a_noop() {
        let notifier = Notifier::disabled();
        // Must return without attempting any network call.
        notifier.send_message("hello").await;
        notifier.notify_startup("DRY RUN").await;
    }
}
