//! One-cancels-the-other: a take-profit limit and a stop, first fill wins

use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::action::StrategyAction;
use super::spec::OcoParams;
use super::traits::{OrderIdAllocator, Strategy};
use crate::engine::MarketData;
use crate::order::{ClientOrderId, FillEvent, Order, OrderKind, OrderRequest, OrderSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegRole {
    TakeProfit,
    Stop,
}

impl LegRole {
    fn as_str(&self) -> &'static str {
        match self {
            LegRole::TakeProfit => "take_profit",
            LegRole::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone)]
struct Leg {
    id: ClientOrderId,
    role: LegRole,
    filled: Decimal,
    terminal: bool,
}

pub struct OcoStrategy {
    ids: OrderIdAllocator,
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    params: OcoParams,
    legs: Vec<Leg>,
    winner: Option<ClientOrderId>,
}

impl OcoStrategy {
    pub fn new(
        ids: OrderIdAllocator,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        params: OcoParams,
    ) -> Self {
        Self {
            ids,
            symbol: symbol.into(),
            side,
            quantity,
            params,
            legs: Vec::with_capacity(2),
            winner: None,
        }
    }

    fn stop_kind(&self) -> OrderKind {
        match self.params.stop_limit_price {
            Some(price) => OrderKind::StopLimit {
                stop_price: self.params.stop_price,
                price,
            },
            None => OrderKind::StopMarket {
                stop_price: self.params.stop_price,
            },
        }
    }

    fn leg(&self, id: ClientOrderId) -> Option<&Leg> {
        self.legs.iter().find(|leg| leg.id == id)
    }

    fn sibling_of(&self, id: ClientOrderId) -> Option<&Leg> {
        self.legs.iter().find(|leg| leg.id != id)
    }
}

impl Strategy for OcoStrategy {
    fn name(&self) -> &'static str {
        "oco"
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
        if !self.legs.is_empty() {
            return StrategyAction::none();
        }

        let take_profit = OrderRequest::limit(
            self.ids.next_id(),
            self.symbol.clone(),
            self.side,
            self.quantity,
            self.params.limit_price,
        );
        let stop = OrderRequest::new(
            self.ids.next_id(),
            self.symbol.clone(),
            self.side,
            self.quantity,
            self.stop_kind(),
        );

        for (request, role) in [(&take_profit, LegRole::TakeProfit), (&stop, LegRole::Stop)] {
            self.legs.push(Leg {
                id: request.client_order_id,
                role,
                filled: Decimal::ZERO,
                terminal: false,
            });
        }

        info!(
            "OCO {} {} {}: take profit @ {}, {} @ {}",
            self.side,
            self.quantity,
            self.symbol,
            self.params.limit_price,
            stop.kind.name(),
            self.params.stop_price
        );
        StrategyAction::linked_pair(take_profit, stop)
    }

    fn on_order_event(&mut self, order: &Order, fill: Option<&FillEvent>) -> StrategyAction {
        let id = order.client_order_id;
        let Some(leg) = self.legs.iter_mut().find(|leg| leg.id == id) else {
            return StrategyAction::none();
        };

        if let Some(fill) = fill {
            leg.filled += fill.quantity;
        }
        leg.terminal = order.state.is_terminal();
        let role = leg.role;

        let mut action = StrategyAction::none();

        if fill.is_some() && self.winner.is_none() {
            self.winner = Some(id);
            if let Some(sibling) = self.sibling_of(id) {
                info!(
                    "OCO {} leg {} filled; cancelling {} leg {}",
                    role.as_str(),
                    id,
                    sibling.role.as_str(),
                    sibling.id
                );
                if !sibling.terminal {
                    action = action.with_cancel(sibling.id);
                }
            }
        }

        if !order.state.is_terminal() {
            return action;
        }

        match self.winner {
            Some(winner) if winner == id && !order.is_fully_filled() => action.merge(
                StrategyAction::fail(format!("winning leg {} {} before completion", id, order.state)),
            ),
            None if self.legs.iter().all(|leg| leg.terminal) => {
                action.merge(StrategyAction::fail("both legs ended without a fill"))
            }
            _ => action,
        }
    }

    fn is_complete(&self) -> bool {
        match self.winner.and_then(|id| self.leg(id)) {
            Some(winner) => {
                winner.filled >= self.quantity
                    && self.sibling_of(winner.id).map_or(true, |leg| leg.terminal)
            }
            None => false,
        }
    }

    fn details(&self) -> Value {
        json!({
            "limit_price": self.params.limit_price,
            "stop_price": self.params.stop_price,
            "stop_limit_price": self.params.stop_limit_price,
            "winner": self
                .winner
                .and_then(|id| self.leg(id))
                .map(|leg| leg.role.as_str()),
        })
    }
}
