//! Shared library for the arbitrage bot.
//!
//! Provides the pieces both the core binary and its tests need:
//! - Configuration loading from .env
//! - Shared market/book/record models
//! - CLOB WebSocket protocol and REST client
//! - Gamma metadata client
//! - EIP-712 order signing
//! - On-chain balance source
//! - Postgres store

pub mod chain;
pub mod clob_api;
pub mod config;
pub mod db;
pub mod gamma;
pub mod models;
pub mod notify;
pub mod signing;
pub mod store;
pub mod ws;

pub use chain::{BalanceSource, ChainClient, ChainError, PositionData};
pub use clob_api::{ApiCreds, ClobApiClient, ClobApiError};
pub use config::{Config, ConfigError};
pub use db::{Database, DbError};
pub use gamma::{GammaClient, GammaError};
pub use models::{
    AlertRecord, ArbAlert, ExecutionRecord, ExecutionReport, ExecutionStatus, Market,
    MarketPrices, NearMissReason, NearMissRecord, OrderResult, PortfolioSnapshot, ScannerStats,
    Side, TopOfBook,
};
pub use notify::Notifier;
pub use signing::{OrderData, OrderSigner, SignedOrder};
pub use ws::{BookEvent, PriceChangeEvent, StreamClient, StreamError, StreamEvent};
