//! On-chain balance and positions queries.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// USDC contract address on Polygon mainnet.
pub const USDC_ADDRESS: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";

/// USDC has 6 decimals.
const USDC_DECIMALS: u32 = 6;

/// ERC-20 balanceOf(address) selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Failed to parse RPC result: {0}")]
    Parse(String),
}

/// Open position reported by the data API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionData {
    /// Token id (the "asset" field).
    pub asset: String,
    pub size: f64,
    #[serde(default)]
    pub cur_price: Option<f64>,
    #[serde(default)]
    pub avg_price: Option<f64>,
    #[serde(default)]
    pub redeemable: Option<bool>,
}

/// Source of on-chain balance and position truth.
/// Mockable for testing via mockall.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Current USDC balance of the trading wallet.
    async fn usdc_balance(&self) -> Result<Decimal, ChainError>;

    /// All open positions for the trading wallet.
    async fn positions(&self) -> Result<Vec<PositionData>, ChainError>;
}

/// Balance source backed by a Polygon JSON-RPC node and the data API.
pub struct ChainClient {
    client: Client,
    rpc_url: String,
    data_api_url: String,
    user_address: String,
}

impl ChainClient {
    pub fn new(rpc_url: &str, user_address: &str) -> Self {
        Self::with_data_api(rpc_url, "https://data-api.polymarket.com", user_address)
    }

    pub fn with_data_api(rpc_url: &str, data_api_url: &str, user_address: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            rpc_url: rpc_url.to_string(),
            data_api_url: data_api_url.trim_end_matches('/').to_string(),
            user_address: user_address.to_lowercase(),
        }
    }

    async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self.client.post(&self.rpc_url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(ChainError::Rpc(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let parsed: JsonRpcResponse<T> = response.json().await?;
        if let Some(error) = parsed.error {
            return Err(ChainError::Rpc(error.message));
        }
        parsed
            .result
            .ok_or_else(|| ChainError::Rpc("empty result".to_string()))
    }
}

#[async_trait]
impl BalanceSource for ChainClient {
    async fn usdc_balance(&self) -> Result<Decimal, ChainError> {
        let data = format!(
            "0x{}{:0>64}",
            BALANCE_OF_SELECTOR,
            self.user_address.trim_start_matches("0x")
        );
        let params = serde_json::json!([
            { "to": USDC_ADDRESS, "data": data },
            "latest"
        ]);

        let result: String = self.rpc_call("eth_call", params).await?;
        let balance = parse_base_units(&result)?;

        debug!(balance = %balance, "Fetched on-chain USDC balance");
        Ok(balance)
    }

    async fn positions(&self) -> Result<Vec<PositionData>, ChainError> {
        let url = format!("{}/positions?user={}", self.data_api_url, self.user_address);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Positions fetch failed");
            return Err(ChainError::Rpc(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        Ok(response.json().await?)
    }
}

/// Total current value of open positions (size x current price).
pub fn positions_value(positions: &[PositionData]) -> Decimal {
    positions
        .iter()
        .filter_map(|p| {
            let size = Decimal::try_from(p.size).ok()?;
            let price = Decimal::try_from(p.cur_price.unwrap_or(0.0)).ok()?;
            Some(size * price)
        })
        .sum()
}

/// Parse a 32-byte hex quantity into USDC (6-decimal base units).
fn parse_base_units(hex_result: &str) -> Result<Decimal, ChainError> {
    let trimmed = hex_result.trim_start_matches("0x");
    let raw = u128::from_str_radix(trimmed, 16)
        .map_err(|e| ChainError::Parse(format!("{}: {}", hex_result, e)))?;
    let raw = i64::try_from(raw)
        .map_err(|_| ChainError::Parse(format!("balance out of range: {}", raw)))?;
    Ok(Decimal::new(raw, USDC_DECIMALS))
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_base_units() {
        // 123.456789 USDC = 123456789 base units = 0x75bcd15
        assert_eq!(parse_base_units("0x75bcd15").unwrap(), dec!(123.456789));
        assert_eq!(parse_base_units("0x0").unwrap(), dec!(0));
    }

    #[test]
    fn test_parse_base_units_rejects_garbage() {
        assert!(parse_base_units("0xzz").is_err());
    }

    #[test]
    fn test_positions_value() {
        let positions = vec![
            PositionData {
                asset: "t1".into(),
                size: 10.0,
                cur_price: Some(0.5),
                avg_price: None,
                redeemable: None,
            },
            PositionData {
                asset: "t2".into(),
                size: 4.0,
                cur_price: Some(0.25),
                avg_price: None,
                redeemable: None,
            },
            PositionData {
                asset: "t3".into(),
                size: 100.0,
                cur_price: None,
                avg_price: None,
                redeemable: None,
            },
        ];
        assert_eq!(positions_value(&positions), dec!(6.0));
    }

    #[test]
    fn test_parse_positions_response() {
        let json = r#"[{"asset":"12345","size":10.5,"curPrice":0.62,"redeemable":true}]"#;
        let positions: Vec<PositionData> = serde_json::from_str(json).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].asset, "12345");
        assert_eq!(positions[0].cur_price, Some(0.62));
        assert_eq!(positions[0].redeemable, Some(true));
    }

    #[tokio::test]
    async fn test_mock_balance_source() {
        let mut mock = MockBalanceSource::new();
        mock.expect_usdc_balance()
            .times(1)
            .returning(|| Ok(dec!(250.75)));

        let balance = mock.usdc_balance().await.unwrap();
        assert_eq!(balance, dec!(250.75));
    }

    #[test]
    fn test_balance_of_calldata_is_padded() {
        let addr = "f39fd6e51aad88f6f4ce6ab8827279cfffb92266";
        let data = format!("0x{}{:0>64}", BALANCE_OF_SELECTOR, addr);
        // 0x + 8 selector chars + 64 argument chars
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.ends_with(addr));
    }
}
