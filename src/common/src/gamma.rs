//! Gamma API client for market metadata discovery.

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::Market;

#[derive(Debug, Error)]
pub enum GammaError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: HTTP {0}")]
    Status(u16),
}

/// Page size for market listing requests.
const PAGE_SIZE: usize = 500;

/// Raw market data from the Gamma /markets endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    pub condition_id: Option<String>,
    pub question: Option<String>,
    /// JSON-encoded string array: `"[\"<yes>\", \"<no>\"]"`.
    pub clob_token_ids: Option<String>,
    #[serde(default)]
    pub neg_risk: Option<bool>,
    pub end_date: Option<DateTime<Utc>>,
    pub liquidity_num: Option<f64>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
}

impl GammaMarket {
    /// Convert to the internal market model. Returns None for markets that
    /// are missing identifiers or do not have exactly two outcome tokens.
    fn into_market(self) -> Option<Market> {
        let id = self.condition_id?;
        let question = self.question.unwrap_or_default();
        let token_ids: Vec<String> =
            serde_json::from_str(self.clob_token_ids.as_deref()?).ok()?;
        if token_ids.len() != 2 {
            return None;
        }
        let liquidity = self
            .liquidity_num
            .and_then(|l| Decimal::try_from(l).ok())
            .unwrap_or(Decimal::ZERO);

        let mut tokens = token_ids.into_iter();
        Some(Market {
            id,
            question,
            yes_token_id: tokens.next()?,
            no_token_id: tokens.next()?,
            neg_risk: self.neg_risk.unwrap_or(false),
            end_date: self.end_date,
            liquidity,
        })
    }
}

/// Gamma API client.
pub struct GammaClient {
    client: Client,
    base_url: String,
}

impl GammaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch all active binary markets meeting the liquidity floor and
    /// resolving within `max_days` (unknown resolution dates are kept).
    pub async fn fetch_active_markets(
        &self,
        min_liquidity: Decimal,
        max_days: i64,
    ) -> Result<Vec<Market>, GammaError> {
        let mut markets = Vec::new();
        let mut offset = 0usize;
        let now = Utc::now();

        loop {
            let page = self.fetch_page(offset).await?;
            let page_len = page.len();

            for raw in page {
                if raw.active == Some(false) || raw.closed == Some(true) {
                    continue;
                }
                let Some(market) = raw.into_market() else {
                    continue;
                };
                if market.liquidity < min_liquidity {
                    continue;
                }
                if let Some(days) = market.days_until_resolution(now) {
                    if days < 0 || days > max_days {
                        continue;
                    }
                }
                markets.push(market);
            }

            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        debug!(
            count = markets.len(),
            min_liquidity = %min_liquidity,
            max_days,
            "Fetched active markets"
        );

        Ok(markets)
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<GammaMarket>, GammaError> {
        let url = format!(
            "{}/markets?active=true&closed=false&limit={}&offset={}",
            self.base_url, PAGE_SIZE, offset
        );

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!(status, "Gamma markets request failed");
            return Err(GammaError::Status(status));
        }

        Ok(response.json().await?)
    }
}
