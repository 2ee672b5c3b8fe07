//! End-to-end runs of the engine runner against the paper gateway

use std::sync::Arc;
use std::time::Duration;

use futures_order_bot::config::{EngineConfig, TradingLimits};
use futures_order_bot::engine::{EngineHandle, EngineRunner, StrategyEngine, StrategyStatus, StrategySummary};
use futures_order_bot::gateway::PaperGateway;
use futures_order_bot::order::{OrderSide, StrategyId};
use futures_order_bot::strategy::{
    GridDirection, GridLadder, GridParams, OcoParams, StrategyKind, StrategySpec, TwapParams,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const SYMBOL: &str = "BTCUSDT";

async fn start(gateway: Arc<PaperGateway>) -> EngineHandle {
    let config = EngineConfig {
        tick_interval_ms: 10,
        retry_base_delay_ms: 1,
        ..EngineConfig::default()
    };
    let engine = StrategyEngine::new(TradingLimits::default(), config.clone());
    let (runner, handle) = EngineRunner::new(engine, gateway, config);
    tokio::spawn(runner.run());
    handle
}

async fn wait_until(
    handle: &EngineHandle,
    id: StrategyId,
    done: impl Fn(&StrategySummary) -> bool,
) -> StrategySummary {
    for _ in 0..500 {
        let summary = handle.status(id).await.unwrap().unwrap();
        if done(&summary) {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("strategy {} did not reach the expected state", id);
}

async fn wait_for_open_orders(gateway: &PaperGateway, count: usize) {
    for _ in 0..500 {
        if gateway.open_order_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("paper book never held {} open orders", count);
}

#[tokio::test]
async fn market_order_completes() {
    let gateway = Arc::new(PaperGateway::new(dec!(100000)));
    gateway.set_price(SYMBOL, dec!(100)).await;
    let handle = start(Arc::clone(&gateway)).await;

    let id = handle
        .submit(StrategySpec::market(SYMBOL, OrderSide::Buy, dec!(0.5)))
        .await
        .unwrap();
    let summary = wait_until(&handle, id, |s| s.status.is_terminal()).await;

    assert_eq!(summary.status, StrategyStatus::Completed);
    assert_eq!(summary.filled_quantity, dec!(0.5));
    assert_eq!(summary.avg_fill_price, Some(dec!(100)));
    assert_eq!(gateway.position(SYMBOL).await.unwrap().size, dec!(0.5));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn oco_take_profit_cancels_stop() {
    let gateway = Arc::new(PaperGateway::new(dec!(100000)));
    gateway.set_price(SYMBOL, dec!(100)).await;
    let handle = start(Arc::clone(&gateway)).await;

    let id = handle
        .submit(StrategySpec::new(
            SYMBOL,
            OrderSide::Sell,
            dec!(1),
            StrategyKind::Oco(OcoParams {
                limit_price: dec!(110),
                stop_price: dec!(90),
                stop_limit_price: None,
            }),
        ))
        .await
        .unwrap();
    wait_for_open_orders(&gateway, 2).await;

    gateway.set_price(SYMBOL, dec!(111)).await;
    let summary = wait_until(&handle, id, |s| s.status.is_terminal()).await;
    assert_eq!(summary.status, StrategyStatus::Completed);
    assert_eq!(summary.filled_quantity, dec!(1));
    assert_eq!(gateway.open_order_count().await, 0);

    // The stop was cancelled, so a crash through it trades nothing more
    gateway.set_price(SYMBOL, dec!(80)).await;
    assert_eq!(gateway.position(SYMBOL).await.unwrap().size, dec!(-1));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn grid_round_trip_books_profit() {
    let gateway = Arc::new(PaperGateway::new(dec!(100000)));
    gateway.set_price(SYMBOL, dec!(102)).await;
    let handle = start(Arc::clone(&gateway)).await;

    let id = handle
        .submit(StrategySpec::new(
            SYMBOL,
            OrderSide::Buy,
            dec!(10),
            StrategyKind::Grid(GridParams {
                ladder: GridLadder::Levels {
                    levels: vec![dec!(100), dec!(102), dec!(104)],
                },
                quantity_per_level: dec!(1),
                direction: GridDirection::Both,
            }),
        ))
        .await
        .unwrap();
    wait_for_open_orders(&gateway, 2).await;

    // Buy at 100 fills; a sell goes up at 102 next to the resting sell at 104
    gateway.set_price(SYMBOL, dec!(100)).await;
    wait_until(&handle, id, |s| s.filled_quantity == dec!(1) && s.working_orders == 2).await;
    wait_for_open_orders(&gateway, 2).await;

    // Sell at 102 closes the round trip and re-arms the buy at 100
    gateway.set_price(SYMBOL, dec!(102)).await;
    let summary = wait_until(&handle, id, |s| s.filled_quantity == dec!(2) && s.working_orders == 2).await;

    let pnl: Decimal = summary.details["realized_pnl"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(pnl, dec!(2));
    assert_eq!(summary.details["round_trips"], 1);
    assert_eq!(summary.status, StrategyStatus::PartiallyFilled);

    handle.cancel(id).await.unwrap();
    let summary = wait_until(&handle, id, |s| s.status.is_terminal()).await;
    assert_eq!(summary.status, StrategyStatus::Cancelled);
    assert_eq!(gateway.open_order_count().await, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn twap_slices_fill_to_target() {
    let gateway = Arc::new(PaperGateway::new(dec!(100000)));
    gateway.set_price(SYMBOL, dec!(100)).await;
    let handle = start(Arc::clone(&gateway)).await;

    let id = handle
        .submit(StrategySpec::new(
            SYMBOL,
            OrderSide::Buy,
            dec!(0.02),
            StrategyKind::Twap(TwapParams::new(2, 1)),
        ))
        .await
        .unwrap();

    let first = wait_until(&handle, id, |s| s.filled_quantity > Decimal::ZERO).await;
    assert_eq!(first.filled_quantity, dec!(0.01));

    let summary = wait_until(&handle, id, |s| s.status.is_terminal()).await;
    assert_eq!(summary.status, StrategyStatus::Completed);
    assert_eq!(summary.filled_quantity, dec!(0.02));
    assert_eq!(summary.avg_fill_price, Some(dec!(100)));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_strategy_does_not_affect_others() {
    let gateway = Arc::new(PaperGateway::new(dec!(1000)));
    gateway.set_price(SYMBOL, dec!(100)).await;
    let handle = start(Arc::clone(&gateway)).await;

    let too_big = handle
        .submit(StrategySpec::limit(SYMBOL, OrderSide::Buy, dec!(1), dec!(45000)))
        .await
        .unwrap();
    let small = handle
        .submit(StrategySpec::market(SYMBOL, OrderSide::Buy, dec!(1)))
        .await
        .unwrap();

    let failed = wait_until(&handle, too_big, |s| s.status.is_terminal()).await;
    assert_eq!(failed.status, StrategyStatus::Failed);
    assert!(failed.failure.unwrap().contains("insufficient balance"));

    let done = wait_until(&handle, small, |s| s.status.is_terminal()).await;
    assert_eq!(done.status, StrategyStatus::Completed);
    handle.shutdown().await.unwrap();
}
