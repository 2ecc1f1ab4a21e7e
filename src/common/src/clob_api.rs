//! CLOB REST client: order submission, book fetch, neg_risk lookup.
//!
//! Order submission is the only traffic that may be routed through the
//! configured SOCKS5 proxy; market data stays on the direct route.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::OrderResult;
use crate::signing::SignedOrder;
use crate::ws::BookEvent;

#[derive(Debug, Error)]
pub enum ClobApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Missing API credentials")]
    MissingCredentials,

    #[error("Invalid proxy URL: {0}")]
    Proxy(String),
}

/// L2 API credentials issued by the exchange.
#[derive(Debug, Clone)]
pub struct ApiCreds {
    pub api_key: String,
    /// Base64url-encoded HMAC secret.
    pub secret: String,
    pub passphrase: String,
}

/// Request wrapper for order submission.
#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    order: &'a SignedOrder,
    owner: &'a str,
    #[serde(rename = "orderType")]
    order_type: &'a str,
}

/// Response from POST /order.
#[derive(Debug, Clone, Deserialize)]
struct PostOrderResponse {
    #[serde(rename = "orderID", default)]
    order_id: Option<String>,
    #[serde(rename = "errorMsg", default)]
    error_msg: Option<String>,
    #[serde(default)]
    status: Option<String>,
    /// Shares received on immediate match, as a decimal string.
    #[serde(rename = "takingAmount", default)]
    taking_amount: Option<String>,
}

/// Response from GET /neg-risk.
#[derive(Debug, Deserialize)]
struct NegRiskResponse {
    neg_risk: bool,
}

/// CLOB REST client.
pub struct ClobApiClient {
    /// Direct client for market data.
    client: Client,
    /// Client for order submission; proxied when a SOCKS5 URL is configured.
    order_client: Client,
    base_url: String,
    creds: Option<ApiCreds>,
    wallet_address: Option<String>,
}

impl ClobApiClient {
    pub fn new(
        base_url: &str,
        creds: Option<ApiCreds>,
        wallet_address: Option<String>,
        socks5_proxy_url: Option<&str>,
    ) -> Result<Self, ClobApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let order_client = match socks5_proxy_url {
            Some(url) => {
                let proxy =
                    reqwest::Proxy::all(url).map_err(|e| ClobApiError::Proxy(e.to_string()))?;
                Client::builder()
                    .timeout(Duration::from_secs(10))
                    .proxy(proxy)
                    .build()?
            }
            None => client.clone(),
        };

        Ok(Self {
            client,
            order_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
            wallet_address,
        })
    }

    /// Submit a signed GTC order. The per-order outcome is returned even for
    /// exchange-side rejections; only transport failures surface as Err.
    pub async fn post_order(&self, order: &SignedOrder) -> Result<OrderResult, ClobApiError> {
        let creds = self.creds.as_ref().ok_or(ClobApiError::MissingCredentials)?;

        let request = OrderRequest {
            order,
            owner: &creds.api_key,
            order_type: "GTC",
        };
        let body = serde_json::to_string(&request).expect("order request serializes");

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = l2_signature(&creds.secret, &timestamp, "POST", "/order", &body);

        let url = format!("{}/order", self.base_url);
        let response = self
            .order_client
            .post(&url)
            .header("POLY_ADDRESS", self.wallet_address.as_deref().unwrap_or(""))
            .header("POLY_SIGNATURE", signature)
            .header("POLY_TIMESTAMP", &timestamp)
            .header("POLY_API_KEY", &creds.api_key)
            .header("POLY_PASSPHRASE", &creds.passphrase)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), body = %text, "Order submission rejected");
            return Ok(OrderResult {
                order_id: None,
                status: format!("http_{}", status.as_u16()),
                filled_size: Decimal::ZERO,
                error: Some(text),
            });
        }

        let parsed: PostOrderResponse = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, body = %text, "Unparseable order response");
                return Ok(OrderResult {
                    order_id: None,
                    status: "unparseable".to_string(),
                    filled_size: Decimal::ZERO,
                    error: Some(text),
                });
            }
        };

        Ok(classify_order_response(parsed))
    }

    /// Fetch the current order book for one token.
    pub async fn get_book(&self, token_id: &str) -> Result<BookEvent, ClobApiError> {
        let url = format!("{}/book?token_id={}", self.base_url, token_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ClobApiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    /// Look up the neg_risk flag for one token.
    pub async fn get_neg_risk(&self, token_id: &str) -> Result<bool, ClobApiError> {
        let url = format!("{}/neg-risk?token_id={}", self.base_url, token_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ClobApiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: NegRiskResponse = response.json().await?;
        debug!(token = %&token_id[..20.min(token_id.len())], neg_risk = parsed.neg_risk, "neg_risk lookup");
        Ok(parsed.neg_risk)
    }
}

/// Classify the exchange's order response into a per-order result.
fn classify_order_response(parsed: PostOrderResponse) -> OrderResult {
    let has_error = parsed
        .error_msg
        .as_ref()
        .map(|e| !e.is_empty())
        .unwrap_or(false);

    let order_id = parsed.order_id.filter(|id| !id.is_empty());
    let filled_size = parsed
        .taking_amount
        .as_deref()
        .and_then(|a| a.parse().ok())
        .unwrap_or(Decimal::ZERO);

    if has_error || order_id.is_none() {
        OrderResult {
            order_id: None,
            status: parsed.status.unwrap_or_else(|| "rejected".to_string()),
            filled_size: Decimal::ZERO,
            error: Some(
                parsed
                    .error_msg
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "no order id returned".to_string()),
            ),
        }
    } else {
        OrderResult {
            order_id,
            status: parsed.status.unwrap_or_else(|| "live".to_string()),
            filled_size,
            error: None,
        }
    }
}

/// HMAC-SHA256 L2 request signature:
/// base64url(HMAC(secret, timestamp + method + path + body)).
fn l2_signature(secret_b64: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
    let key = URL_SAFE
        .decode(secret_b64)
        .unwrap_or_else(|_| secret_b64.as_bytes().to_vec());

    let mut mac =
        Hmac::<Sha256>::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());

    URL_SAFE.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn response(
        order_id: Option<&str>,
        error_msg: Option<&str>,
        taking: Option<&str>,
    ) -> PostOrderResponse {
        PostOrderResponse {
            order_id: order_id.map(String::from),
            error_msg: error_msg.map(String::from),
            status: Some("matched".to_string()),
            taking_amount: taking.map(String::from),
        }
    }

    #[test]
    fn test_classify_success() {
        let result = classify_order_response(response(Some("0xorder"), None, Some("50")));
        assert!(result.succeeded());
        assert_eq!(result.order_id.as_deref(), Some("0xorder"));
        assert_eq!(result.filled_size, dec!(50));
    }

    #[test]
    fn test_classify_error_message_wins() {
        let result =
            classify_order_response(response(Some("0xorder"), Some("not enough balance"), None));
        assert!(!result.succeeded());
        assert_eq!(result.error.as_deref(), Some("not enough balance"));
    }

    #[test]
    fn test_classify_empty_order_id_is_failure() {
        let result = classify_order_response(response(Some(""), None, None));
        assert!(!result.succeeded());
    }

    #[test]
    fn test_classify_empty_error_string_ignored() {
        let result = classify_order_response(response(Some("0xorder"), Some(""), None));
        assert!(result.succeeded());
    }

    #[test]
    fn test_l2_signature_is_deterministic() {
        let sig1 = l2_signature("c2VjcmV0", "1700000000", "POST", "/order", "{}");
        let sig2 = l2_signature("c2VjcmV0", "1700000000", "POST", "/order", "{}");
        assert_eq!(sig1, sig2);
        assert!(!sig1.is_empty());
    }

    #[test]
    fn test_l2_signature_varies_with_body() {
        let sig1 = l2_signature("c2VjcmV0", "1700000000", "POST", "/order", "{}");
        let sig2 = l2_signature("c2VjcmV0", "1700000000", "POST", "/order", "{\"a\":1}");
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn test_order_request_wrapper_shape() {
        let order = SignedOrder {
            salt: 1,
            maker: "0xm".into(),
            signer: "0xm".into(),
            taker: "0x0".into(),
            token_id: "123".into(),
            maker_amount: "1000000".into(),
            taker_amount: "2000000".into(),
            expiration: "0".into(),
            nonce: "0".into(),
            fee_rate_bps: "0".into(),
            side: 0,
            signature_type: 0,
            signature: "0xsig".into(),
        };
        let request = OrderRequest {
            order: &order,
            owner: "api-key-1",
            order_type: "GTC",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["owner"], "api-key-1");
        assert_eq!(json["orderType"], "GTC");
        assert_eq!(json["order"]["tokenId"], "123");
    }
}
