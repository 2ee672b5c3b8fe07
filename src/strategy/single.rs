//! Plain limit and market orders

use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::action::StrategyAction;
use super::traits::{OrderIdAllocator, Strategy};
use crate::engine::MarketData;
use crate::order::{ClientOrderId, FillEvent, Order, OrderKind, OrderRequest, OrderSide};

/// A single order; done when it fills
pub struct SingleOrderStrategy {
    ids: OrderIdAllocator,
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    kind: OrderKind,
    order: Option<ClientOrderId>,
    filled: Decimal,
}

impl SingleOrderStrategy {
    pub fn new(
        ids: OrderIdAllocator,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        kind: OrderKind,
    ) -> Self {
        Self {
            ids,
            symbol: symbol.into(),
            side,
            quantity,
            kind,
            order: None,
            filled: Decimal::ZERO,
        }
    }
}

impl Strategy for SingleOrderStrategy {
    fn name(&self) -> &'static str {
        match self.kind {
            OrderKind::Market => "market",
            _ => "limit",
        }
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn side(&self) -> OrderSide {
        self.side
    }

    fn target_quantity(&self) -> Decimal {
        self.quantity
    }

    fn on_tick(&mut self, _now: DateTime<Utc>, _market: &dyn MarketData) -> StrategyAction {
        if self.order.is_some() {
            return StrategyAction::none();
        }

        let id = self.ids.next_id();
        self.order = Some(id);
        info!(
            "{} {} {} {} submitted as {}",
            self.kind.name(),
            self.side,
            self.quantity,
            self.symbol,
            id
        );
        StrategyAction::single(OrderRequest::new(
            id,
            self.symbol.clone(),
            self.side,
            self.quantity,
            self.kind,
        ))
    }

    fn on_order_event(&mut self, order: &Order, fill: Option<&FillEvent>) -> StrategyAction {
        if self.order != Some(order.client_order_id) {
            return StrategyAction::none();
        }

        if let Some(fill) = fill {
            self.filled += fill.quantity;
        }

        if order.state.is_terminal() && !order.is_fully_filled() {
            return StrategyAction::fail(format!(
                "order {} {} with {} of {} filled",
                order.client_order_id, order.state, order.filled_quantity, self.quantity
            ));
        }
        StrategyAction::none()
    }

    fn is_complete(&self) -> bool {
        self.filled >= self.quantity
    }

    fn details(&self) -> Value {
        json!({
            "order": self.order.map(|id| id.to_string()),
            "price": self.kind.limit_price(),
        })
    }
}
