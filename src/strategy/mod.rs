//! Strategy Interface Module
//!
//! Strategies turn a submitted [`StrategySpec`] into orders. They are
//! decoupled from the exchange: the engine calls them on ticks and on events
//! for their own orders, and they answer with a [`StrategyAction`].
//!
//! # Design
//!
//! - **Decoupled**: strategies never see the gateway or the tracker
//! - **Testable**: call `on_tick` and `on_order_event` directly
//! - **Stateful**: each strategy owns its progress and its client order ids
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use futures_order_bot::engine::PriceBook;
//! use futures_order_bot::order::{OrderSide, StrategyId};
//! use futures_order_bot::strategy::{build, StrategySpec};
//! use futures_order_bot::config::{EngineConfig, TradingLimits};
//! use rust_decimal_macros::dec;
//!
//! let spec = StrategySpec::market("BTCUSDT", OrderSide::Buy, dec!(0.01));
//! let mut strategy = build(
//!     StrategyId(1),
//!     &spec,
//!     &TradingLimits::default(),
//!     &EngineConfig::default(),
//! );
//!
//! let action = strategy.on_tick(Utc::now(), &PriceBook::new());
//! assert_eq!(action.orders.len(), 1);
//! ```

mod action;
mod grid;
mod oco;
mod single;
mod spec;
mod traits;
mod twap;

pub use action::StrategyAction;
pub use grid::GridStrategy;
pub use oco::OcoStrategy;
pub use single::SingleOrderStrategy;
pub use spec::{
    GridDirection, GridLadder, GridParams, OcoParams, StrategyKind, StrategySpec, TwapParams,
};
pub use traits::{OrderIdAllocator, Strategy};
pub use twap::TwapStrategy;

use crate::config::{EngineConfig, TradingLimits};
use crate::order::{OrderKind, StrategyId};

/// Instantiate the strategy described by a validated spec
pub fn build(
    id: StrategyId,
    spec: &StrategySpec,
    limits: &TradingLimits,
    engine: &EngineConfig,
) -> Box<dyn Strategy> {
    let ids = OrderIdAllocator::new(id);
    let symbol = spec.symbol.clone();

    match &spec.kind {
        StrategyKind::Limit { price } => Box::new(SingleOrderStrategy::new(
            ids,
            symbol,
            spec.side,
            spec.quantity,
            OrderKind::Limit {
                price: limits.round_price(*price),
            },
        )),
        StrategyKind::Market => Box::new(SingleOrderStrategy::new(
            ids,
            symbol,
            spec.side,
            spec.quantity,
            OrderKind::Market,
        )),
        StrategyKind::Oco(params) => {
            let params = OcoParams {
                limit_price: limits.round_price(params.limit_price),
                stop_price: limits.round_price(params.stop_price),
                stop_limit_price: params.stop_limit_price.map(|p| limits.round_price(p)),
            };
            Box::new(OcoStrategy::new(ids, symbol, spec.side, spec.quantity, params))
        }
        StrategyKind::Twap(params) => Box::new(TwapStrategy::new(
            ids,
            symbol,
            spec.side,
            spec.quantity,
            params,
            limits.quantity_precision,
            engine.max_consecutive_skips,
        )),
        StrategyKind::Grid(params) => Box::new(GridStrategy::new(
            ids,
            symbol,
            spec.side,
            spec.quantity,
            params.ladder.prices(limits),
            params.quantity_per_level,
            params.direction,
        )),
    }
}
