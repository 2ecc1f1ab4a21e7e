//! Cross-side arbitrage bot for binary prediction markets.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod balance;
mod bot;
mod detector;
mod executor;
mod registry;
mod sink;
mod stream;

use common::chain::{positions_value, BalanceSource, ChainClient};
use common::clob_api::ClobApiClient;
use common::config::Config;
use common::db::Database;
use common::gamma::GammaClient;
use common::store;

use bot::RealtimeBot;

/// Cross-side arbitrage bot: buys YES and NO when their asks sum below $1.
#[derive(Parser, Debug)]
#[command(name = "arb-bot")]
#[command(about = "Cross-side arbitrage bot for binary prediction markets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bot continuously
    Run {
        /// Simulate trades without submitting orders
        #[arg(long, conflicts_with = "live")]
        dry_run: bool,

        /// Submit real orders (requires credentials)
        #[arg(long)]
        live: bool,

        /// Stream order books over WebSocket (default)
        #[arg(long, conflicts_with = "polling")]
        realtime: bool,

        /// Legacy polling mode
        #[arg(long)]
        polling: bool,
    },

    /// One-shot scan: fetch books for the top candidates and print spreads
    Scan,

    /// List candidate markets
    Markets,

    /// Print the order book for one token
    Orderbook { token_id: String },

    /// Show live scanner statistics
    Status,

    /// Show the on-chain USDC balance and positions value
    Balance,

    /// Show realized expected profit from filled executions
    Pnl,

    /// Show recent executions
    Trades {
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// List open positions
    Positions,

    /// List resolved positions awaiting redemption
    Redeem,

    /// Print the approvals the redemption job needs
    ApproveRedemption,

    /// Dashboard pointer (the web UI ships separately)
    Dashboard,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run {
            dry_run,
            live,
            realtime: _,
            polling,
        } => {
            let mut config = config;
            if live {
                config.dry_run = false;
            } else if dry_run {
                config.dry_run = true;
            }

            if !config.dry_run && !config.is_trading_enabled() {
                error!(
                    "Live trading requires PRIVATE_KEY and WALLET_ADDRESS. \
                     Set them in .env or run with --dry-run."
                );
                std::process::exit(1);
            }

            run_bot(config, !polling).await
        }
        Command::Scan => scan_once(&config).await,
        Command::Markets => list_markets(&config).await,
        Command::Orderbook { token_id } => print_orderbook(&config, &token_id).await,
        Command::Status => print_status(&config).await,
        Command::Balance => print_balance(&config).await,
        Command::Pnl => print_pnl(&config).await,
        Command::Trades { limit } => print_trades(&config, limit).await,
        Command::Positions => print_positions(&config).await,
        Command::Redeem => print_redeemable(&config).await,
        Command::ApproveRedemption => {
            println!(
                "Redemption runs as a separate job. Approve the conditional tokens\n\
                 contract to spend USDC for the trading wallet, then start the job."
            );
            Ok(())
        }
        Command::Dashboard => {
            println!("The web dashboard ships separately and reads the same database.");
            println!("Point it at DATABASE_URL and it will pick up scanner_stats and alerts.");
            Ok(())
        }
        Command::Config => print_config(&config),
    }
}

async fn run_bot(config: Config, realtime: bool) -> Result<()> {
    let db = Database::connect(&config).await?;
    db.health_check().await?;
    info!("Database connected");

    let bot = RealtimeBot::new(config, db).await?;

    let mut run_task = tokio::spawn(Arc::clone(&bot).run(realtime));

    tokio::select! {
        result = &mut run_task => {
            result??;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            bot.stop();
            run_task.await??;
        }
    }

    Ok(())
}

async fn scan_once(config: &Config) -> Result<()> {
    let gamma = GammaClient::new(&config.gamma_base_url);
    let api = ClobApiClient::new(&config.clob_base_url, None, None, None)?;

    let mut markets = gamma
        .fetch_active_markets(config.min_liquidity_usd, config.max_days_until_resolution)
        .await?;
    markets.sort_by(|a, b| b.liquidity.cmp(&a.liquidity));
    markets.truncate(100);

    println!("Scanning {} markets...", markets.len());

    let mut rows = Vec::new();
    let mut fetches = futures_util::stream::iter(markets.into_iter().map(|market| {
        let api = &api;
        async move {
            let yes = api.get_book(&market.yes_token_id).await.ok();
            let no = api.get_book(&market.no_token_id).await.ok();
            (market, yes, no)
        }
    }))
    .buffer_unordered(16);

    while let Some((market, yes, no)) = fetches.next().await {
        let (Some(yes), Some(no)) = (yes, no) else {
            continue;
        };
        let (Some(yes_ask), Some(no_ask)) = (yes.best_ask(), no.best_ask()) else {
            continue;
        };
        let combined = yes_ask + no_ask;
        rows.push((market, yes_ask, no_ask, combined, Decimal::ONE - combined));
    }

    rows.sort_by(|a, b| b.4.cmp(&a.4));
    rows.truncate(15);

    println!(
        "\n  {:<50} {:>6} {:>6} {:>8} {:>8}",
        "Market", "YES", "NO", "Combined", "Profit"
    );
    println!("  {:-<50} {:-<6} {:-<6} {:-<8} {:-<8}", "", "", "", "", "");
    for (market, yes_ask, no_ask, combined, profit) in &rows {
        println!(
            "  {:<50} ${:.2} ${:.2} ${:.4} {:>+.2}%",
            market.short_question(48),
            yes_ask,
            no_ask,
            combined,
            profit * Decimal::ONE_HUNDRED,
        );
    }
    println!();

    Ok(())
}

async fn list_markets(config: &Config) -> Result<()> {
    let gamma = GammaClient::new(&config.gamma_base_url);
    let mut markets = gamma
        .fetch_active_markets(config.min_liquidity_usd, config.max_days_until_resolution)
        .await?;
    markets.sort_by(|a, b| b.liquidity.cmp(&a.liquidity));

    println!("{} candidate markets", markets.len());
    println!(
        "\n  {:<50} {:>12} {:>12} {:>8}",
        "Market", "Liquidity", "Resolves", "NegRisk"
    );
    println!("  {:-<50} {:-<12} {:-<12} {:-<8}", "", "", "", "");
    for market in markets.iter().take(30) {
        println!(
            "  {:<50} ${:>11.0} {:>12} {:>8}",
            market.short_question(48),
            market.liquidity,
            market
                .end_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            market.neg_risk,
        );
    }

    Ok(())
}

async fn print_orderbook(config: &Config, token_id: &str) -> Result<()> {
    let api = ClobApiClient::new(&config.clob_base_url, None, None, None)?;
    let book = api.get_book(token_id).await?;

    println!("Order book for {}", token_id);
    println!(
        "  best bid: {}   best ask: {}   size at ask: {}",
        book.best_bid().map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        book.best_ask().map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        book.ask_size_at_best()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into()),
    );

    println!("\n  {:>10} {:>12}   {:>10} {:>12}", "BID", "SIZE", "ASK", "SIZE");
    for i in 0..5usize {
        let bid = book.bids.get(i);
        let ask = book.asks.get(i);
        println!(
            "  {:>10} {:>12}   {:>10} {:>12}",
            bid.map(|l| l.price.as_str()).unwrap_or(""),
            bid.map(|l| l.size.as_str()).unwrap_or(""),
            ask.map(|l| l.price.as_str()).unwrap_or(""),
            ask.map(|l| l.size.as_str()).unwrap_or(""),
        );
    }

    Ok(())
}

async fn print_status(config: &Config) -> Result<()> {
    let db = Database::connect(config).await?;
    match store::load_scanner_stats(db.pool()).await? {
        Some(stats) => {
            println!("Scanner status");
            println!("  markets:           {}", stats.markets);
            println!("  price updates:     {}", stats.price_updates);
            println!("  arbitrage alerts:  {}", stats.arbitrage_alerts);
            println!("  ws connected:      {}", stats.ws_connected);
            println!("  ws connections:    {}", stats.ws_connections);
            println!("  subscribed tokens: {}", stats.subscribed_tokens);
        }
        None => println!("Scanner has not run yet."),
    }
    Ok(())
}

async fn print_balance(config: &Config) -> Result<()> {
    let Some(wallet) = config.wallet_address.as_deref() else {
        println!("WALLET_ADDRESS is not configured.");
        return Ok(());
    };

    let chain = ChainClient::new(&config.polygon_rpc_url, wallet);
    let balance = chain.usdc_balance().await?;
    let positions = chain.positions().await.unwrap_or_default();
    let value = positions_value(&positions);

    println!("USDC balance:    ${:.2}", balance);
    println!("Positions value: ${:.2}", value);
    println!("Total:           ${:.2}", balance + value);
    Ok(())
}

async fn print_pnl(config: &Config) -> Result<()> {
    let db = Database::connect(config).await?;
    let (filled, profit) = store::pnl_summary(db.pool()).await?;
    println!("Filled executions: {}", filled);
    println!("Expected profit:   ${:.2}", profit);
    Ok(())
}

async fn print_trades(config: &Config, limit: i64) -> Result<()> {
    let db = Database::connect(config).await?;
    let executions = store::recent_executions(db.pool(), limit).await?;

    if executions.is_empty() {
        println!("No executions recorded.");
        return Ok(());
    }

    println!(
        "  {:<19} {:<40} {:>7} {:>7} {:>9} {:>8}",
        "Time", "Market", "Status", "Size", "Cost", "Profit"
    );
    println!(
        "  {:-<19} {:-<40} {:-<7} {:-<7} {:-<9} {:-<8}",
        "", "", "", "", "", ""
    );
    for execution in &executions {
        let market: String = execution.market.chars().take(40).collect();
        println!(
            "  {:<19} {:<40} {:>7} {:>7.0} {:>9.2} {:>8.2}",
            execution.timestamp.format("%Y-%m-%d %H:%M:%S"),
            market,
            execution.status,
            execution.yes_size,
            execution.total_cost,
            execution.expected_profit,
        );
    }

    Ok(())
}

async fn print_positions(config: &Config) -> Result<()> {
    let Some(wallet) = config.wallet_address.as_deref() else {
        println!("WALLET_ADDRESS is not configured.");
        return Ok(());
    };

    let chain = ChainClient::new(&config.polygon_rpc_url, wallet);
    let positions = chain.positions().await?;

    if positions.is_empty() {
        println!("No open positions.");
        return Ok(());
    }

    println!("  {:<44} {:>10} {:>10} {:>10}", "Token", "Size", "Price", "Value");
    println!("  {:-<44} {:-<10} {:-<10} {:-<10}", "", "", "", "");
    for position in &positions {
        let price = position.cur_price.unwrap_or(0.0);
        println!(
            "  {:<44} {:>10.2} {:>10.3} {:>10.2}",
            &position.asset[..position.asset.len().min(44)],
            position.size,
            price,
            position.size * price,
        );
    }

    Ok(())
}

async fn print_redeemable(config: &Config) -> Result<()> {
    let Some(wallet) = config.wallet_address.as_deref() else {
        println!("WALLET_ADDRESS is not configured.");
        return Ok(());
    };

    let chain = ChainClient::new(&config.polygon_rpc_url, wallet);
    let positions = chain.positions().await?;
    let redeemable: Vec<_> = positions
        .iter()
        .filter(|p| p.redeemable == Some(true))
        .collect();

    if redeemable.is_empty() {
        println!("No resolved positions awaiting redemption.");
        return Ok(());
    }

    println!("{} resolved position(s) ready for redemption:", redeemable.len());
    for position in &redeemable {
        println!(
            "  {}  size {:.2}",
            &position.asset[..position.asset.len().min(44)],
            position.size
        );
    }
    println!("\nRun the redemption job to claim them on-chain.");

    Ok(())
}

fn print_config(config: &Config) -> Result<()> {
    println!("mode:                      {}", if config.dry_run { "dry-run" } else { "live" });
    println!("min_profit_threshold:      {}", config.min_profit_threshold);
    println!("max_position_size_usd:     {}", config.max_position_size_usd);
    println!("min_liquidity_usd:         {}", config.min_liquidity_usd);
    println!("max_days_until_resolution: {}", config.max_days_until_resolution);
    println!("num_ws_connections:        {}", config.num_ws_connections);
    println!("poll_interval_seconds:     {}", config.poll_interval_seconds);
    println!("gamma_base_url:            {}", config.gamma_base_url);
    println!("clob_base_url:             {}", config.clob_base_url);
    println!("clob_ws_url:               {}", config.clob_ws_url);
    println!("polygon_rpc_url:           {}", config.polygon_rpc_url);
    println!("wallet_address:            {}", config.wallet_address.as_deref().unwrap_or("unset"));
    println!("credentials:               {}", if config.is_trading_enabled() { "configured" } else { "missing" });
    println!("api creds:                 {}", if config.poly_api_key.is_some() { "configured" } else { "missing" });
    println!("socks5 proxy:              {}", if config.socks5_proxy_url().is_some() { "configured" } else { "none" });
    println!("slack webhook:             {}", if config.slack_webhook_url.is_some() { "configured" } else { "none" });
    Ok(())
}
