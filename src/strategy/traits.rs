//! Strategy trait definition

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::action::StrategyAction;
use crate::engine::MarketData;
use crate::order::{ClientOrderId, FillEvent, Order, OrderSide, StrategyId};

/// Strategy interface for order execution logic
///
/// A strategy receives engine ticks and events for its own orders, and returns
/// the orders it wants placed or cancelled. It never talks to the exchange.
///
/// # Lifecycle
///
/// 1. The engine calls `on_tick` while the strategy is running
/// 2. The strategy returns a [`StrategyAction`] with orders to place
/// 3. The engine tracks those orders and hands them to the gateway
/// 4. When one of its orders fills or ends, the engine calls `on_order_event`
/// 5. The strategy updates internal state and may return more orders
///
/// Once the strategy has no working orders and `is_complete` returns true the
/// engine marks it completed. Cancellation and failure are driven by the
/// engine; the strategy is not called after either.
pub trait Strategy: Send {
    /// Short kind name, used in logs and summaries
    fn name(&self) -> &'static str;

    fn symbol(&self) -> &str;

    fn side(&self) -> OrderSide;

    /// Quantity the strategy intends to execute in total
    fn target_quantity(&self) -> Decimal;

    /// Called on every engine tick
    fn on_tick(&mut self, now: DateTime<Utc>, market: &dyn MarketData) -> StrategyAction;

    /// Called after an update to one of this strategy's orders was applied
    ///
    /// `order` reflects the update. `fill` is the execution it carried, if any,
    /// as recorded by the tracker.
    fn on_order_event(&mut self, order: &Order, fill: Option<&FillEvent>) -> StrategyAction;

    /// Whether the strategy has reached its goal
    fn is_complete(&self) -> bool;

    /// Strategy-specific progress for status reports
    fn details(&self) -> Value {
        Value::Null
    }
}

/// Hands out client order ids for one strategy
#[derive(Debug, Clone)]
pub struct OrderIdAllocator {
    strategy: StrategyId,
    next_seq: u32,
}

impl OrderIdAllocator {
    pub fn new(strategy: StrategyId) -> Self {
        Self {
            strategy,
            next_seq: 1,
        }
    }

    pub fn strategy(&self) -> StrategyId {
        self.strategy
    }

    pub fn next_id(&mut self) -> ClientOrderId {
        let id = ClientOrderId::new(self.strategy, self.next_seq);
        self.next_seq += 1;
        id
    }
}
