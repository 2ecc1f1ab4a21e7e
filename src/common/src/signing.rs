//! EIP-712 order signing for the CLOB exchange contracts.
//!
//! Each market's `neg_risk` flag selects which of two exchange contracts
//! clears its orders, and the verifying contract is part of the EIP-712
//! domain, so the wrong domain produces an unfillable signature.

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol_types::SolValue;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Chain ID for Polygon mainnet.
pub const POLYGON_CHAIN_ID: u64 = 137;

/// CTF Exchange contract address on Polygon mainnet.
pub const CTF_EXCHANGE_ADDRESS: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

/// Neg Risk CTF Exchange contract address on Polygon mainnet.
pub const NEG_RISK_CTF_EXCHANGE_ADDRESS: &str = "0xC5d563A36AE78145C45a50134d48A1215220f80a";

/// Base units per USDC / per share (both use 6 decimals).
const BASE_UNITS: u64 = 1_000_000;

/// Order side for signing and submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy = 0,
    Sell = 1,
}

impl OrderSide {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// EIP-712 domain for an exchange contract.
#[derive(Debug, Clone)]
pub struct ExchangeDomain {
    pub name: String,
    pub version: String,
    pub chain_id: U256,
    pub verifying_contract: Address,
}

impl ExchangeDomain {
    /// Domain for the standard CTF Exchange.
    pub fn ctf_exchange() -> Self {
        Self {
            name: "Polymarket CTF Exchange".to_string(),
            version: "1".to_string(),
            chain_id: U256::from(POLYGON_CHAIN_ID),
            verifying_contract: CTF_EXCHANGE_ADDRESS.parse().expect("Invalid CTF address"),
        }
    }

    /// Domain for the Neg Risk CTF Exchange.
    pub fn neg_risk_ctf_exchange() -> Self {
        Self {
            name: "Polymarket CTF Exchange".to_string(),
            version: "1".to_string(),
            chain_id: U256::from(POLYGON_CHAIN_ID),
            verifying_contract: NEG_RISK_CTF_EXCHANGE_ADDRESS
                .parse()
                .expect("Invalid Neg Risk CTF address"),
        }
    }

    /// Domain selected by a market's neg_risk flag.
    pub fn for_neg_risk(neg_risk: bool) -> Self {
        if neg_risk {
            Self::neg_risk_ctf_exchange()
        } else {
            Self::ctf_exchange()
        }
    }

    /// Compute the EIP-712 domain separator hash.
    pub fn separator(&self) -> B256 {
        let domain_type_hash = keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
        );
        let name_hash = keccak256(self.name.as_bytes());
        let version_hash = keccak256(self.version.as_bytes());

        let encoded = (
            domain_type_hash,
            name_hash,
            version_hash,
            self.chain_id,
            self.verifying_contract,
        )
            .abi_encode_packed();

        keccak256(&encoded)
    }
}

/// Raw order data matching the exchange contract's Order struct.
#[derive(Debug, Clone)]
pub struct OrderData {
    pub salt: U256,
    pub maker: Address,
    pub signer: Address,
    /// Zero for any taker.
    pub taker: Address,
    pub token_id: U256,
    /// For a buy: USDC paid, in base units.
    pub maker_amount: U256,
    /// For a buy: shares received, in base units.
    pub taker_amount: U256,
    /// Zero for GTC orders.
    pub expiration: U256,
    pub nonce: U256,
    pub fee_rate_bps: U256,
    pub side: u8,
    pub signature_type: u8,
}

impl OrderData {
    /// Build a GTC buy order for `shares` at `price`.
    ///
    /// Returns None when the token id does not parse or the amounts
    /// collapse to zero.
    pub fn gtc_buy(maker: Address, token_id: &str, price: Decimal, shares: Decimal) -> Option<Self> {
        let token_id = U256::from_str_radix(token_id, 10).ok()?;
        let (maker_amount, taker_amount) = buy_amounts(price, shares)?;
        if maker_amount.is_zero() || taker_amount.is_zero() {
            return None;
        }

        Some(Self {
            salt: U256::from(rand_salt()),
            maker,
            signer: maker,
            taker: Address::ZERO,
            token_id,
            maker_amount,
            taker_amount,
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            fee_rate_bps: U256::ZERO,
            side: OrderSide::Buy.as_u8(),
            signature_type: 0,
        })
    }

    /// Compute the EIP-712 struct hash for this order.
    pub fn struct_hash(&self) -> B256 {
        let order_type_hash = keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)",
        );

        // EIP-712 encodeData pads every value to 32 bytes, addresses included.
        let maker_padded = B256::left_padding_from(self.maker.as_slice());
        let signer_padded = B256::left_padding_from(self.signer.as_slice());
        let taker_padded = B256::left_padding_from(self.taker.as_slice());

        let encoded = (
            order_type_hash,
            self.salt,
            maker_padded,
            signer_padded,
            taker_padded,
            self.token_id,
            self.maker_amount,
            self.taker_amount,
            self.expiration,
            self.nonce,
            self.fee_rate_bps,
            U256::from(self.side),
            U256::from(self.signature_type),
        )
            .abi_encode_packed();

        keccak256(&encoded)
    }
}

/// Convert a buy of `shares` at `price` to integer base-unit amounts.
fn buy_amounts(price: Decimal, shares: Decimal) -> Option<(U256, U256)> {
    if price <= Decimal::ZERO || shares <= Decimal::ZERO {
        return None;
    }
    let base = Decimal::from(BASE_UNITS);
    let maker = (price * shares * base).floor();
    let taker = (shares * base).floor();
    Some((
        U256::from(maker.to_string().parse::<u128>().ok()?),
        U256::from(taker.to_string().parse::<u128>().ok()?),
    ))
}

/// Generate a random salt for order uniqueness.
/// Masked to 2^53-1 (IEEE 754 safe integer range) as required by the CLOB API.
fn rand_salt() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let raw = (nanos ^ ((std::process::id() as u128) << 32)) as u64;
    raw & ((1u64 << 53) - 1)
}

/// A signed order in the CLOB submission wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOrder {
    /// Order salt (must be a JSON number).
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "makerAmount")]
    pub maker_amount: String,
    #[serde(rename = "takerAmount")]
    pub taker_amount: String,
    pub expiration: String,
    pub nonce: String,
    #[serde(rename = "feeRateBps")]
    pub fee_rate_bps: String,
    /// 0 = buy, 1 = sell.
    pub side: u8,
    #[serde(rename = "signatureType")]
    pub signature_type: u8,
    /// EIP-712 signature as 0x-prefixed hex.
    pub signature: String,
}

impl SignedOrder {
    fn from_order_data(order: &OrderData, signature: String) -> Self {
        Self {
            salt: order.salt.to::<u64>(),
            maker: format!("{:?}", order.maker),
            signer: format!("{:?}", order.signer),
            taker: format!("{:?}", order.taker),
            token_id: format!("{}", order.token_id),
            maker_amount: format!("{}", order.maker_amount),
            taker_amount: format!("{}", order.taker_amount),
            expiration: format!("{}", order.expiration),
            nonce: format!("{}", order.nonce),
            fee_rate_bps: format!("{}", order.fee_rate_bps),
            side: order.side,
            signature_type: order.signature_type,
            signature,
        }
    }
}

/// Signs orders against one of the two exchange domains.
#[derive(Clone)]
pub struct OrderSigner {
    signer: PrivateKeySigner,
}

impl OrderSigner {
    /// Create a signer from a 0x-prefixed private key.
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .context("Invalid private key format")?;
        Ok(Self { signer })
    }

    /// Wallet address of the signing key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign an order against the domain selected by `neg_risk`.
    pub async fn sign_order(&self, order: &OrderData, neg_risk: bool) -> Result<SignedOrder> {
        let domain = ExchangeDomain::for_neg_risk(neg_risk);
        let digest = typed_data_hash(domain.separator(), order.struct_hash());

        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .context("Failed to sign order")?;

        Ok(SignedOrder::from_order_data(
            order,
            format!("0x{}", hex::encode(signature.as_bytes())),
        ))
    }
}

impl std::fmt::Debug for OrderSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSigner")
            .field("address", &format!("{:?}", self.address()))
            .finish()
    }
}

/// keccak256("\x19\x01" || domainSeparator || structHash)
fn typed_data_hash(domain_separator: B256, struct_hash: B256) -> B256 {
    // The u8 annotation matters: without it the tuple encodes 4 bytes per
    // prefix element instead of 1.
    let prefix: [u8; 2] = [0x19, 0x01];
    let data = (prefix, domain_separator, struct_hash).abi_encode_packed();
    keccak256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Test private key (hardhat account 0 - DO NOT USE IN PRODUCTION)
    const TEST_PRIVATE_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn test_signer() -> OrderSigner {
        OrderSigner::from_private_key(TEST_PRIVATE_KEY).unwrap()
    }

    #[test]
    fn test_signer_address() {
        assert_eq!(
            test_signer().address().to_string().to_lowercase(),
            TEST_ADDRESS.to_lowercase()
        );
    }

    #[test]
    fn test_domains_differ_by_contract() {
        let ctf = ExchangeDomain::ctf_exchange();
        let neg = ExchangeDomain::neg_risk_ctf_exchange();
        assert_eq!(ctf.name, neg.name);
        assert_ne!(ctf.verifying_contract, neg.verifying_contract);
        assert_ne!(ctf.separator(), neg.separator());
    }

    #[test]
    fn test_for_neg_risk_selects_contract() {
        assert_eq!(
            ExchangeDomain::for_neg_risk(false).verifying_contract,
            CTF_EXCHANGE_ADDRESS.parse::<Address>().unwrap()
        );
        assert_eq!(
            ExchangeDomain::for_neg_risk(true).verifying_contract,
            NEG_RISK_CTF_EXCHANGE_ADDRESS.parse::<Address>().unwrap()
        );
    }

    #[test]
    fn test_buy_amounts_base_units() {
        // 50 shares at $0.45 = $22.50 maker / 50 shares taker
        let (maker, taker) = buy_amounts(dec!(0.45), dec!(50)).unwrap();
        assert_eq!(maker, U256::from(22_500_000u64));
        assert_eq!(taker, U256::from(50_000_000u64));
    }

    #[test]
    fn test_buy_amounts_rejects_zero() {
        assert!(buy_amounts(dec!(0), dec!(50)).is_none());
        assert!(buy_amounts(dec!(0.45), dec!(0)).is_none());
    }

    #[test]
    fn test_gtc_buy_is_gtc() {
        let maker: Address = TEST_ADDRESS.parse().unwrap();
        let order = OrderData::gtc_buy(maker, "12345", dec!(0.45), dec!(50)).unwrap();
        assert_eq!(order.expiration, U256::ZERO);
        assert_eq!(order.nonce, U256::ZERO);
        assert_eq!(order.fee_rate_bps, U256::ZERO);
        assert_eq!(order.side, 0);
        assert_eq!(order.signature_type, 0);
        assert_eq!(order.taker, Address::ZERO);
        assert!(order.salt < U256::from(1u64 << 53));
    }

    #[test]
    fn test_gtc_buy_rejects_bad_token_id() {
        let maker: Address = TEST_ADDRESS.parse().unwrap();
        assert!(OrderData::gtc_buy(maker, "not-a-number", dec!(0.45), dec!(50)).is_none());
    }

    #[test]
    fn test_struct_hash_changes_with_salt() {
        let maker: Address = TEST_ADDRESS.parse().unwrap();
        let mut order = OrderData::gtc_buy(maker, "123", dec!(0.5), dec!(10)).unwrap();
        order.salt = U256::from(1u64);
        let h1 = order.struct_hash();
        order.salt = U256::from(2u64);
        let h2 = order.struct_hash();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn test_sign_order_produces_65_byte_signature() {
        let signer = test_signer();
        let order = OrderData::gtc_buy(signer.address(), "123", dec!(0.5), dec!(10)).unwrap();

        let signed = signer.sign_order(&order, false).await.unwrap();

        // 0x + 130 hex chars (65 bytes)
        assert!(signed.signature.starts_with("0x"));
        assert_eq!(signed.signature.len(), 132);
        assert_eq!(signed.side, 0);
        assert_eq!(signed.expiration, "0");
    }

    #[tokio::test]
    async fn test_signatures_differ_across_domains() {
        let signer = test_signer();
        let mut order = OrderData::gtc_buy(signer.address(), "123", dec!(0.5), dec!(10)).unwrap();
        order.salt = U256::from(999u64);

        let standard = signer.sign_order(&order, false).await.unwrap();
        let neg_risk = signer.sign_order(&order, true).await.unwrap();
        assert_ne!(standard.signature, neg_risk.signature);
    }

    #[tokio::test]
    async fn test_signatures_are_deterministic() {
        let signer = test_signer();
        let mut order = OrderData::gtc_buy(signer.address(), "123", dec!(0.5), dec!(10)).unwrap();
        order.salt = U256::from(999u64);

        let s1 = signer.sign_order(&order, false).await.unwrap();
        let s2 = signer.sign_order(&order, false).await.unwrap();
        assert_eq!(s1.signature, s2.signature);
    }

    #[test]
    fn test_signed_order_json_shape() {
        let maker: Address = TEST_ADDRESS.parse().unwrap();
        let order = OrderData::gtc_buy(maker, "123", dec!(0.5), dec!(10)).unwrap();
        let signed = SignedOrder::from_order_data(&order, "0xsig".to_string());

        let json = serde_json::to_value(&signed).unwrap();
        assert!(json.get("makerAmount").is_some());
        assert!(json.get("takerAmount").is_some());
        assert!(json.get("tokenId").is_some());
        assert!(json.get("feeRateBps").is_some());
        assert!(json.get("signatureType").is_some());
        // salt is a JSON number, side is numeric
        assert!(json.get("salt").unwrap().is_u64());
        assert_eq!(json.get("side").unwrap().as_u64(), Some(0));
    }

    #[test]
    fn test_debug_does_not_expose_key() {
        let signer = test_signer();
        let debug_str = format!("{:?}", signer);
        assert!(debug_str.contains("address"));
        assert!(!debug_str.contains(&TEST_PRIVATE_KEY[2..]));
    }
}
