use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::action::StrategyAction;
use super::spec::GridDirection;
use super::traits::{OrderIdAllocator, Strategy};
use crate::engine::MarketData;
use crate::order::{ClientOrderId, FillEvent, Order, OrderRequest, OrderSide};

#[derive(Debug, Clone)]
struct GridLevel {
    price: Decimal,
    /// Working order resting at this level
    order: Option<ClientOrderId>,
}

#[derive(Debug, Clone)]
struct GridOrder {
    level: usize,
    side: OrderSide,
    /// Fill price of the leg this order closes, if it is a counter order
    opened_at: Option<Decimal>,
}

/// Ladder of limit orders that re-quotes the adjacent level after each fill
///
/// The level closest to the market is left empty at start; levels below get
/// buys and levels above get sells. A filled buy at level i is answered with
/// a sell at i+1, a filled sell at i with a buy at i-1. The target quantity
/// caps the total volume the grid may trade.
pub struct GridStrategy {
    ids: OrderIdAllocator,
    symbol: String,
    side: OrderSide,
    budget: Decimal,
    quantity_per_level: Decimal,
    direction: GridDirection,
    levels: Vec<GridLevel>,
    orders: HashMap<ClientOrderId, GridOrder>,
    started: bool,

    /// Filled volume plus the unfilled part of working orders
    committed: Decimal,
    traded_volume: Decimal,
    realized_pnl: Decimal,
    round_trips: u32,
}

impl GridStrategy {
    pub fn new(
        ids: OrderIdAllocator,
        symbol: impl Into<String>,
        side: OrderSide,
        budget: Decimal,
        prices: Vec<Decimal>,
        quantity_per_level: Decimal,
        direction: GridDirection,
    ) -> Self {
        let levels = prices
            .into_iter()
            .map(|price| GridLevel { price, order: None })
            .collect();

        Self {
            ids,
            symbol: symbol.into(),
            side,
            budget,
            quantity_per_level,
            direction,
            levels,
            orders: HashMap::new(),
            started: false,
            committed: Decimal::ZERO,
            traded_volume: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            round_trips: 0,
        }
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    fn closest_level(&self, price: Decimal) -> usize {
        self.levels
            .iter()
            .enumerate()
            .min_by_key(|(_, level)| (level.price - price).abs())
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn available(&self) -> Decimal {
        self.budget - self.committed
    }

    fn place(
        &mut self,
        level: usize,
        side: OrderSide,
        quantity: Decimal,
        opened_at: Option<Decimal>,
    ) -> OrderRequest {
        let id = self.ids.next_id();
        let price = self.levels[level].price;
        self.levels[level].order = Some(id);
        self.committed += quantity;
        self.orders.insert(
            id,
            GridOrder {
                level,
                side,
                opened_at,
            },
        );
        OrderRequest::limit(id, self.symbol.clone(), side, quantity, price)
    }

    /// Initial ladder: nearest levels first, within direction and budget
    fn initial_orders(&mut self, market_price: Decimal) -> Vec<OrderRequest> {
        let closest = self.closest_level(market_price);
        let mut candidates: Vec<usize> = (0..self.levels.len()).filter(|&i| i != closest).collect();
        candidates.sort_by_key(|&i| (i.abs_diff(closest), i));

        let mut orders = Vec::new();
        for idx in candidates {
            let side = if idx < closest {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            if !self.direction.allows(side) {
                continue;
            }
            if self.quantity_per_level > self.available() {
                debug!("Grid {} volume budget reached at level {}", self.ids.strategy(), idx);
                break;
            }
            orders.push(self.place(idx, side, self.quantity_per_level, None));
        }
        orders
    }

    /// Counter order for a filled leg at the adjacent level
    fn counter_order(
        &mut self,
        filled: &GridOrder,
        quantity: Decimal,
        fill_price: Decimal,
    ) -> Option<OrderRequest> {
        let target = match filled.side {
            OrderSide::Buy => filled.level + 1,
            OrderSide::Sell => filled.level.checked_sub(1)?,
        };
        let side = filled.side.opposite();
        let level = self.levels.get(target)?;

        if let Some(existing) = level.order {
            warn!(
                "Grid {} level {} already holds {}; no counter order",
                self.ids.strategy(),
                target,
                existing
            );
            return None;
        }
        if quantity > self.available() {
            info!("Grid {} volume budget exhausted; no counter order", self.ids.strategy());
            return None;
        }

        // A counter order closes the leg that opened; once closed the next one opens afresh
        let opened_at = match filled.opened_at {
            Some(_) => None,
            None => Some(fill_price),
        };
        Some(self.place(target, side, quantity, opened_at))
    }

    fn log_grid_status(&self, current_price: Option<Decimal>) {
        match current_price {
            Some(price) => info!("--- Grid {} (price ~{}) ---", self.ids.strategy(), price),
            None => info!("--- Grid {} ---", self.ids.strategy()),
        }
        for (idx, level) in self.levels.iter().enumerate().rev() {
            let status = match level.order.and_then(|id| self.orders.get(&id)) {
                Some(order) => match order.side {
                    OrderSide::Buy => "BUY  ",
                    OrderSide::Sell => "SELL ",
                },
                None => "EMPTY",
            };
            info!("Lvl {:02} | {} | {}", idx, status, level.price);
        }
    }
}

impl Strategy for GridStrategy {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn side(&self) -> OrderSide {
        self.side
    }

    fn target_quantity(&self) -> Decimal {
        self.budget
    }

    fn on_tick(&mut self, _now: DateTime<Utc>, market: &dyn MarketData) -> StrategyAction {
        if self.started {
            return StrategyAction::none();
        }
        let Some(price) = market.last_price(&self.symbol) else {
            debug!("Grid {} waiting for a {} price", self.ids.strategy(), self.symbol);
            return StrategyAction::none();
        };

        self.started = true;
        let orders = self.initial_orders(price);
        if orders.is_empty() {
            return StrategyAction::fail(format!(
                "no {:?} grid level can be placed around {}",
                self.direction, price
            ));
        }
        self.log_grid_status(Some(price));
        StrategyAction::multiple(orders)
    }

    fn on_order_event(&mut self, order: &Order, fill: Option<&FillEvent>) -> StrategyAction {
        let id = order.client_order_id;
        let Some(meta) = self.orders.get(&id).cloned() else {
            return StrategyAction::none();
        };

        if let Some(fill) = fill {
            self.traded_volume += fill.quantity;
            if let Some(open) = meta.opened_at {
                let pnl = match meta.side {
                    OrderSide::Sell => (fill.price - open) * fill.quantity,
                    OrderSide::Buy => (open - fill.price) * fill.quantity,
                };
                self.realized_pnl += pnl;
            }
        }

        if !order.state.is_terminal() {
            return StrategyAction::none();
        }

        self.orders.remove(&id);
        if self.levels[meta.level].order == Some(id) {
            self.levels[meta.level].order = None;
        }
        self.committed -= order.remaining();

        if order.filled_quantity.is_zero() {
            info!(
                "Grid {} level {} order {} {} without fill",
                self.ids.strategy(),
                meta.level,
                id,
                order.state
            );
            return StrategyAction::none();
        }

        if meta.opened_at.is_some() {
            self.round_trips += 1;
        }
        info!(
            "Grid {} Lvl {:02} | {} | {} @ {} filled (pnl {})",
            self.ids.strategy(),
            meta.level,
            meta.side,
            order.filled_quantity,
            order.avg_fill_price,
            self.realized_pnl
        );

        let counter = self.counter_order(&meta, order.filled_quantity, order.avg_fill_price);
        if counter.is_some() {
            self.log_grid_status(Some(order.avg_fill_price));
        }
        counter.into()
    }

    fn is_complete(&self) -> bool {
        self.started && self.orders.is_empty()
    }

    fn details(&self) -> Value {
        json!({
            "levels": self.levels.len(),
            "range": format!(
                "{} - {}",
                self.levels.first().map(|l| l.price).unwrap_or_default(),
                self.levels.last().map(|l| l.price).unwrap_or_default()
            ),
            "working_orders": self.orders.len(),
            "traded_volume": self.traded_volume,
            "round_trips": self.round_trips,
            "realized_pnl": self.realized_pnl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PriceBook;
    use crate::order::{OrderState, StrategyId};
    use rust_decimal_macros::dec;

    fn grid(levels: &[Decimal], budget: Decimal, direction: GridDirection) -> GridStrategy {
        GridStrategy::new(
            OrderIdAllocator::new(StrategyId(1)),
            "BTCUSDT",
            OrderSide::Buy,
            budget,
            levels.to_vec(),
            dec!(1),
            direction,
        )
    }

    fn market(price: Decimal) -> PriceBook {
        let mut book = PriceBook::new();
        book.set("BTCUSDT", price);
        book
    }

    fn filled(request: &OrderRequest, price: Decimal) -> (Order, FillEvent) {
        let mut order = Order::new(request.clone());
        let fill = order
            .record_fill(&FillEvent::new(format!("f-{}", request.client_order_id), request.quantity, price))
            .unwrap();
        order.state = OrderState::Filled;
        (order, fill)
    }

    #[test]
    fn test_waits_for_market_price() {
        let mut strategy = grid(&[dec!(100), dec!(102), dec!(104)], dec!(10), GridDirection::Both);
        assert!(strategy.on_tick(Utc::now(), &PriceBook::new()).is_empty());
        assert!(!strategy.is_complete());
    }

    #[test]
    fn test_initial_ladder_skips_closest_level() {
        let mut strategy = grid(&[dec!(100), dec!(102), dec!(104)], dec!(10), GridDirection::Both);
        let action = strategy.on_tick(Utc::now(), &market(dec!(102.3)));

        let placed: Vec<(OrderSide, Option<Decimal>)> =
            action.orders.iter().map(|o| (o.side, o.price())).collect();
        assert_eq!(
            placed,
            vec![(OrderSide::Buy, Some(dec!(100))), (OrderSide::Sell, Some(dec!(104)))]
        );
        assert!(strategy.on_tick(Utc::now(), &market(dec!(102.3))).is_empty());
    }

    #[test]
    fn test_filled_buy_reissues_sell_above() {
        let mut strategy = grid(&[dec!(100), dec!(102), dec!(104)], dec!(10), GridDirection::Both);
        let action = strategy.on_tick(Utc::now(), &market(dec!(102)));
        let buy = action.orders.iter().find(|o| o.side == OrderSide::Buy).unwrap();

        let (order, fill) = filled(buy, dec!(100));
        let counter = strategy.on_order_event(&order, Some(&fill));
        assert_eq!(counter.orders.len(), 1);
        assert_eq!(counter.orders[0].side, OrderSide::Sell);
        assert_eq!(counter.orders[0].price(), Some(dec!(102)));
        assert_eq!(counter.orders[0].quantity, dec!(1));
    }

    #[test]
    fn test_round_trip_pnl() {
        let mut strategy = grid(&[dec!(100), dec!(102), dec!(104)], dec!(10), GridDirection::BuyOnly);
        let action = strategy.on_tick(Utc::now(), &market(dec!(102)));
        assert_eq!(action.orders.len(), 1);

        let (order, fill) = filled(&action.orders[0], dec!(100));
        let sell = strategy.on_order_event(&order, Some(&fill));
        let (order, fill) = filled(&sell.orders[0], dec!(102));
        let rebuy = strategy.on_order_event(&order, Some(&fill));

        assert_eq!(strategy.realized_pnl(), dec!(2));
        assert_eq!(rebuy.orders[0].side, OrderSide::Buy);
        assert_eq!(rebuy.orders[0].price(), Some(dec!(100)));
        assert_eq!(strategy.details()["round_trips"], 1);
    }

    #[test]
    fn test_budget_limits_ladder_and_counters() {
        let levels = [dec!(100), dec!(101), dec!(102), dec!(103), dec!(104)];
        let mut strategy = grid(&levels, dec!(2), GridDirection::Both);
        let action = strategy.on_tick(Utc::now(), &market(dec!(102)));

        // Nearest levels first: 101 and 103
        let prices: Vec<Option<Decimal>> = action.orders.iter().map(|o| o.price()).collect();
        assert_eq!(prices, vec![Some(dec!(101)), Some(dec!(103))]);

        let (order, fill) = filled(&action.orders[0], dec!(101));
        let counter = strategy.on_order_event(&order, Some(&fill));
        assert!(counter.is_empty());
    }

    #[test]
    fn test_completes_at_ladder_edge() {
        let mut strategy = grid(&[dec!(100), dec!(102)], dec!(10), GridDirection::Both);
        let action = strategy.on_tick(Utc::now(), &market(dec!(100)));
        assert_eq!(action.orders.len(), 1);
        assert_eq!(action.orders[0].side, OrderSide::Sell);

        let (order, fill) = filled(&action.orders[0], dec!(102));
        let counter = strategy.on_order_event(&order, Some(&fill));
        assert_eq!(counter.orders[0].price(), Some(dec!(100)));

        let (order, fill) = filled(&counter.orders[0], dec!(100));
        let next = strategy.on_order_event(&order, Some(&fill));
        assert_eq!(next.orders[0].price(), Some(dec!(102)));

        let mut cancelled = Order::new(next.orders[0].clone());
        cancelled.state = OrderState::Cancelled;
        assert!(strategy.on_order_event(&cancelled, None).is_empty());
        assert!(strategy.is_complete());
    }

    #[test]
    fn test_direction_with_no_eligible_level_fails() {
        let mut strategy = grid(&[dec!(100), dec!(102)], dec!(10), GridDirection::SellOnly);
        let action = strategy.on_tick(Utc::now(), &market(dec!(105)));
        assert!(action.failure.is_some());
    }
}
