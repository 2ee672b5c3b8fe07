//! Order Bot Binary
//!
//! Runs a single strategy (limit, market, OCO, TWAP or grid) through the
//! strategy engine against the paper-trading gateway, until the strategy
//! finishes or Ctrl-C cancels it.
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the project root:
//!    ```text
//!    BINANCE_API_KEY=your-key
//!    BINANCE_API_SECRET=your-secret
//!    BINANCE_TESTNET=true
//!    ```
//!
//! 2. Run a strategy:
//!    ```bash
//!    cargo run --bin order_bot -- twap BUY 0.01 --duration 300 --interval 60
//!    cargo run --bin order_bot -- --config bot.toml grid BUY 0.05 --lower 44000 --upper 46000 --count 6 --per-level 0.01
//!    ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::time::interval;

use futures_order_bot::{
    config::Settings,
    engine::{EngineRunner, EngineSnapshot, StrategyEngine},
    gateway::{ExchangeGateway, PaperGateway},
    order::OrderSide,
    strategy::{GridDirection, GridLadder, GridParams, OcoParams, StrategyKind, StrategySpec, TwapParams},
};

#[derive(Parser)]
#[command(name = "order_bot")]
#[command(about = "Grid, OCO, TWAP, limit and market order automation", long_about = None)]
struct Cli {
    /// Configuration file (TOML); environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place a single limit order
    Limit {
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Place a single market order
    Market {
        side: OrderSide,
        quantity: Decimal,
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Take-profit limit and stop, whichever fills first cancels the other
    Oco {
        side: OrderSide,
        quantity: Decimal,
        #[arg(long)]
        limit_price: Decimal,
        #[arg(long)]
        stop_price: Decimal,
        /// Use a stop-limit at this price instead of a stop-market
        #[arg(long)]
        stop_limit_price: Option<Decimal>,
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Split a market order into slices sent at a fixed interval
    Twap {
        side: OrderSide,
        quantity: Decimal,
        /// Seconds between slices
        #[arg(long, default_value = "60")]
        interval: u64,
        /// Number of slices
        #[arg(long, conflicts_with = "duration")]
        slices: Option<u32>,
        /// Total duration in seconds (slices = duration / interval)
        #[arg(long)]
        duration: Option<u64>,
        /// Skip slices while the price is beyond this limit
        #[arg(long)]
        price_limit: Option<Decimal>,
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Ladder of buy and sell orders re-issued as they fill
    Grid {
        side: OrderSide,
        /// Total fill volume the grid may trade
        budget: Decimal,
        /// Quantity of each grid order
        #[arg(long)]
        per_level: Decimal,
        /// Explicit price levels, comma separated
        #[arg(long, value_delimiter = ',', conflicts_with_all = ["lower", "upper", "count"])]
        levels: Vec<Decimal>,
        #[arg(long, requires_all = ["upper", "count"])]
        lower: Option<Decimal>,
        #[arg(long)]
        upper: Option<Decimal>,
        #[arg(long)]
        count: Option<u32>,
        /// both, buy_only or sell_only
        #[arg(long, default_value = "both")]
        direction: String,
        #[arg(short, long)]
        symbol: Option<String>,
    },
}

impl Command {
    fn into_spec(self, default_symbol: &str) -> Result<StrategySpec, Box<dyn std::error::Error>> {
        let symbol = |s: Option<String>| s.unwrap_or_else(|| default_symbol.to_string()).to_uppercase();

        let spec = match self {
            Command::Limit {
                side,
                quantity,
                price,
                symbol: s,
            } => StrategySpec::limit(symbol(s), side, quantity, price),
            Command::Market {
                side,
                quantity,
                symbol: s,
            } => StrategySpec::market(symbol(s), side, quantity),
            Command::Oco {
                side,
                quantity,
                limit_price,
                stop_price,
                stop_limit_price,
                symbol: s,
            } => StrategySpec::new(
                symbol(s),
                side,
                quantity,
                StrategyKind::Oco(OcoParams {
                    limit_price,
                    stop_price,
                    stop_limit_price,
                }),
            ),
            Command::Twap {
                side,
                quantity,
                interval,
                slices,
                duration,
                price_limit,
                symbol: s,
            } => {
                let params = match (slices, duration) {
                    (Some(slices), _) => TwapParams::new(slices, interval),
                    (None, Some(duration)) => TwapParams::from_duration(duration, interval)?,
                    (None, None) => return Err("twap needs --slices or --duration".into()),
                };
                StrategySpec::new(
                    symbol(s),
                    side,
                    quantity,
                    StrategyKind::Twap(params.with_price_limit(price_limit)),
                )
            }
            Command::Grid {
                side,
                budget,
                per_level,
                levels,
                lower,
                upper,
                count,
                direction,
                symbol: s,
            } => {
                let ladder = match (lower, upper, count) {
                    (Some(lower_price), Some(upper_price), Some(grid_count)) => GridLadder::Range {
                        lower_price,
                        upper_price,
                        grid_count,
                    },
                    _ if !levels.is_empty() => GridLadder::Levels { levels },
                    _ => return Err("grid needs --levels or --lower/--upper/--count".into()),
                };
                StrategySpec::new(
                    symbol(s),
                    side,
                    budget,
                    StrategyKind::Grid(GridParams {
                        ladder,
                        quantity_per_level: per_level,
                        direction: parse_direction(&direction)?,
                    }),
                )
            }
        };
        Ok(spec)
    }
}

fn parse_direction(value: &str) -> Result<GridDirection, Box<dyn std::error::Error>> {
    match value.to_lowercase().replace('-', "_").as_str() {
        "both" => Ok(GridDirection::Both),
        "buy_only" | "buy" => Ok(GridDirection::BuyOnly),
        "sell_only" | "sell" => Ok(GridDirection::SellOnly),
        other => Err(format!("unknown grid direction '{}'", other).into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let dotenv = dotenvy::dotenv();
    let settings = Settings::load(cli.config.as_deref())?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&settings.log.level)).init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }
    if settings.exchange.testnet {
        info!("Using TESTNET ({})", settings.exchange.base_url());
    }
    debug!("Exchange settings: {:?}", settings.exchange);

    let spec = cli.command.into_spec(&settings.trading.default_symbol)?;
    info!("Strategy: {}", spec);

    let gateway = Arc::new(PaperGateway::from_config(&settings.paper));
    gateway.set_price(&spec.symbol, settings.paper.initial_price).await;
    let feed = tokio::spawn(random_walk(
        Arc::clone(&gateway),
        spec.symbol.clone(),
        settings.clone(),
    ));

    let engine = StrategyEngine::new(settings.trading.clone(), settings.engine.clone());
    let (runner, handle) = EngineRunner::new(engine, Arc::clone(&gateway), settings.engine.clone());
    let runner_task = tokio::spawn(runner.run());

    let id = handle.submit(spec).await?;
    info!("Strategy {} is now RUNNING (Ctrl-C to cancel)", id);

    let mut poll = interval(Duration::from_secs(1));
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    warn!("Second interrupt, stopping without waiting for cancellation");
                    break;
                }
                interrupted = true;
                warn!("Interrupted, cancelling strategy {}", id);
                if let Err(e) = handle.cancel(id).await {
                    warn!("Cancel failed: {}", e);
                }
            }
            _ = poll.tick() => {
                match handle.status(id).await? {
                    Some(summary) if summary.status.is_terminal() => break,
                    Some(summary) => debug!(
                        "{} {}: filled {}/{} ({} working)",
                        summary.id, summary.status, summary.filled_quantity,
                        summary.target_quantity, summary.working_orders
                    ),
                    None => break,
                }
            }
        }
    }

    let snapshot = handle.shutdown().await?;
    feed.abort();
    runner_task.await??;

    print_report(&snapshot, &gateway).await;
    Ok(())
}

/// Drive the paper market with a bounded random walk
async fn random_walk(gateway: Arc<PaperGateway>, symbol: String, settings: Settings) {
    let step = i64::from(settings.paper.price_step_bps);
    let mut price = settings.paper.initial_price;
    let mut ticker = interval(settings.engine.tick_interval());

    loop {
        ticker.tick().await;
        let bps = rand::thread_rng().gen_range(-step..=step);
        let next = settings
            .trading
            .round_price(price * (Decimal::ONE + Decimal::new(bps, 4)));
        if next > Decimal::ZERO {
            price = next;
        }
        gateway.set_price(&symbol, price).await;
    }
}

async fn print_report(snapshot: &EngineSnapshot, gateway: &PaperGateway) {
    println!("\n=== Final report ===");
    for summary in &snapshot.strategies {
        println!(
            "{} {} {} {}: {} (filled {} of {}, avg {})",
            summary.id,
            summary.kind,
            summary.side,
            summary.symbol,
            summary.status,
            summary.filled_quantity,
            summary.target_quantity,
            summary
                .avg_fill_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        if let Some(reason) = &summary.failure {
            println!("  failure: {}", reason);
        }
        if !summary.details.is_null() {
            println!("  details: {}", summary.details);
        }
        if let Some(position) = gateway.position(&summary.symbol).await {
            let unrealized = match gateway.last_price(&summary.symbol).await {
                Ok(price) => position.unrealized_pnl(price).round_dp(4).to_string(),
                Err(_) => "-".to_string(),
            };
            println!(
                "  position: {} @ {} (realized {}, unrealized {})",
                position.size, position.entry_price, position.realized_pnl, unrealized
            );
        }
    }
    println!("Paper balance: {}", gateway.balance().await);
    println!("Fees paid: {}", gateway.total_fees().await);
}
