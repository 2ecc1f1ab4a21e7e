//! Repository functions for persisted records.
//!
//! Free functions over a `PgPool`, one per record kind. All writes are
//! issued from the persistence sink worker, never from the price-update
//! path.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::{
    AlertRecord, ExecutionRecord, MinuteStatsRow, NearMissRecord, PortfolioSnapshot,
    ScannerStats, StatsHistoryRow,
};

/// Insert an arbitrage alert. Duration is normally NULL here and backfilled
/// by `update_alert_duration` when the opportunity closes.
pub async fn insert_alert(pool: &PgPool, alert: &AlertRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO alerts
            (market, yes_ask, no_ask, combined, profit, timestamp, platform,
             days_until_resolution, resolution_date, first_seen, duration_secs)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&alert.market)
    .bind(alert.yes_ask)
    .bind(alert.no_ask)
    .bind(alert.combined)
    .bind(alert.profit)
    .bind(alert.timestamp)
    .bind(&alert.platform)
    .bind(alert.days_until_resolution)
    .bind(alert.resolution_date)
    .bind(alert.first_seen)
    .bind(alert.duration_secs)
    .execute(pool)
    .await?;

    Ok(())
}

/// Backfill the duration of the most recent open alert for a market.
/// Returns true when a row was updated.
pub async fn update_alert_duration(
    pool: &PgPool,
    market: &str,
    duration_secs: f64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE alerts
        SET duration_secs = $2
        WHERE id = (
            SELECT id FROM alerts
            WHERE market = $1 AND duration_secs IS NULL
            ORDER BY timestamp DESC
            LIMIT 1
        )
        "#,
    )
    .bind(market)
    .bind(duration_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn insert_near_miss(pool: &PgPool, record: &NearMissRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO near_miss_alerts
            (timestamp, market, yes_ask, no_ask, combined, profit_pct,
             yes_liquidity, no_liquidity, min_required, reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(record.timestamp)
    .bind(&record.market)
    .bind(record.yes_ask)
    .bind(record.no_ask)
    .bind(record.combined)
    .bind(record.profit_pct)
    .bind(record.yes_liquidity)
    .bind(record.no_liquidity)
    .bind(record.min_required)
    .bind(&record.reason)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_execution(pool: &PgPool, record: &ExecutionRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (timestamp, market, status,
             yes_order_id, yes_status, yes_price, yes_size, yes_filled_size,
             no_order_id, no_status, no_price, no_size, no_filled_size,
             total_cost, expected_profit)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(record.timestamp)
    .bind(&record.market)
    .bind(&record.status)
    .bind(&record.yes_order_id)
    .bind(&record.yes_status)
    .bind(record.yes_price)
    .bind(record.yes_size)
    .bind(record.yes_filled_size)
    .bind(&record.no_order_id)
    .bind(&record.no_status)
    .bind(record.no_price)
    .bind(record.no_size)
    .bind(record.no_filled_size)
    .bind(record.total_cost)
    .bind(record.expected_profit)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_portfolio_snapshot(
    pool: &PgPool,
    snapshot: &PortfolioSnapshot,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO portfolio_snapshots (timestamp, polymarket_usdc, total_usd, positions_value)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(snapshot.timestamp)
    .bind(snapshot.polymarket_usdc)
    .bind(snapshot.total_usd)
    .bind(snapshot.positions_value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert the scanner stats singleton (id = 1).
pub async fn update_scanner_stats(pool: &PgPool, stats: &ScannerStats) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO scanner_stats
            (id, markets, price_updates, arbitrage_alerts, ws_connected,
             ws_connections, subscribed_tokens, last_update)
        VALUES (1, $1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            markets = EXCLUDED.markets,
            price_updates = EXCLUDED.price_updates,
            arbitrage_alerts = EXCLUDED.arbitrage_alerts,
            ws_connected = EXCLUDED.ws_connected,
            ws_connections = EXCLUDED.ws_connections,
            subscribed_tokens = EXCLUDED.subscribed_tokens,
            last_update = EXCLUDED.last_update
        "#,
    )
    .bind(stats.markets)
    .bind(stats.price_updates)
    .bind(stats.arbitrage_alerts)
    .bind(stats.ws_connected)
    .bind(&stats.ws_connections)
    .bind(stats.subscribed_tokens)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_stats_history(pool: &PgPool, row: &StatsHistoryRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO stats_history
            (timestamp, hour, markets, price_updates, arbitrage_alerts,
             executions_attempted, executions_filled, ws_connected)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(row.timestamp)
    .bind(&row.hour)
    .bind(row.markets)
    .bind(row.price_updates)
    .bind(row.arbitrage_alerts)
    .bind(row.executions_attempted)
    .bind(row.executions_filled)
    .bind(row.ws_connected)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_minute_stats(pool: &PgPool, row: &MinuteStatsRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO minute_stats (timestamp, minute, price_updates, ws_connected)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(row.timestamp)
    .bind(&row.minute)
    .bind(row.price_updates)
    .bind(row.ws_connected)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent executions, newest first. Used by the trades CLI command.
pub async fn recent_executions(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT timestamp, market, status,
               yes_order_id, yes_status, yes_price, yes_size, yes_filled_size,
               no_order_id, no_status, no_price, no_size, no_filled_size,
               total_cost, expected_profit
        FROM executions
        ORDER BY timestamp DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Most recent alerts, newest first.
pub async fn recent_alerts(pool: &PgPool, limit: i64) -> Result<Vec<AlertRecord>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT market, yes_ask, no_ask, combined, profit, timestamp, platform,
               days_until_resolution, resolution_date, first_seen, duration_secs
        FROM alerts
        ORDER BY timestamp DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Filled-execution count and summed expected profit.
pub async fn pnl_summary(pool: &PgPool) -> Result<(i64, Decimal), sqlx::Error> {
    let row: (i64, Option<Decimal>) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(expected_profit), 0)
        FROM executions
        WHERE status = 'FILLED'
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok((row.0, row.1.unwrap_or(Decimal::ZERO)))
}

/// Latest scanner stats snapshot, if the scanner has ever run.
pub async fn load_scanner_stats(pool: &PgPool) -> Result<Option<ScannerStats>, sqlx::Error> {
    let row: Option<(i64, i64, i64, bool, String, i64)> = sqlx::query_as(
        r#"
        SELECT markets, price_updates, arbitrage_alerts, ws_connected,
               ws_connections, subscribed_tokens
        FROM scanner_stats
        WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(markets, price_updates, arbitrage_alerts, ws_connected, ws_connections, subscribed)| {
            ScannerStats {
                markets,
                price_updates,
                arbitrage_alerts,
                ws_connected,
                ws_connections,
                subscribed_tokens: subscribed,
            }
        },
    ))
}
