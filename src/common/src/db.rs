//! Database connection and schema management.

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::Config;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &Config) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database connection is healthy.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the record tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), DbError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id BIGSERIAL PRIMARY KEY,
        market TEXT NOT NULL,
        yes_ask NUMERIC NOT NULL,
        no_ask NUMERIC NOT NULL,
        combined NUMERIC NOT NULL,
        profit NUMERIC NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        platform TEXT NOT NULL DEFAULT 'polymarket',
        days_until_resolution BIGINT,
        resolution_date TIMESTAMPTZ,
        first_seen TIMESTAMPTZ,
        duration_secs DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS near_miss_alerts (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        market TEXT NOT NULL,
        yes_ask NUMERIC NOT NULL,
        no_ask NUMERIC NOT NULL,
        combined NUMERIC NOT NULL,
        profit_pct NUMERIC NOT NULL,
        yes_liquidity NUMERIC NOT NULL,
        no_liquidity NUMERIC NOT NULL,
        min_required NUMERIC NOT NULL,
        reason TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        market TEXT NOT NULL,
        status TEXT NOT NULL,
        yes_order_id TEXT,
        yes_status TEXT,
        yes_price NUMERIC NOT NULL,
        yes_size NUMERIC NOT NULL,
        yes_filled_size NUMERIC NOT NULL,
        no_order_id TEXT,
        no_status TEXT,
        no_price NUMERIC NOT NULL,
        no_size NUMERIC NOT NULL,
        no_filled_size NUMERIC NOT NULL,
        total_cost NUMERIC NOT NULL,
        expected_profit NUMERIC NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS portfolio_snapshots (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        polymarket_usdc NUMERIC NOT NULL,
        total_usd NUMERIC NOT NULL,
        positions_value NUMERIC NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scanner_stats (
        id INT PRIMARY KEY,
        markets BIGINT NOT NULL,
        price_updates BIGINT NOT NULL,
        arbitrage_alerts BIGINT NOT NULL,
        ws_connected BOOLEAN NOT NULL,
        ws_connections TEXT NOT NULL,
        subscribed_tokens BIGINT NOT NULL,
        last_update TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stats_history (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        hour TEXT NOT NULL,
        markets BIGINT NOT NULL,
        price_updates BIGINT NOT NULL,
        arbitrage_alerts BIGINT NOT NULL,
        executions_attempted BIGINT NOT NULL,
        executions_filled BIGINT NOT NULL,
        ws_connected BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS minute_stats (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        minute TEXT NOT NULL,
        price_updates BIGINT NOT NULL,
        ws_connected BOOLEAN NOT NULL
    )
    "#,
];
