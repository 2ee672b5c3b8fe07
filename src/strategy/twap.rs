//! Time-weighted average price execution
//!
//! Splits the target into equal market-order slices sent one per interval.
//! Slices are truncated to the lot precision and the last slice takes the
//! remainder, so a fully executed TWAP trades exactly its target.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{json, Value};

use super::action::StrategyAction;
use super::spec::TwapParams;
use super::traits::{OrderIdAllocator, Strategy};
use crate::engine::MarketData;
use crate::order::{FillEvent, Order, OrderRequest, OrderSide};

pub struct TwapStrategy {
    ids: OrderIdAllocator,
    symbol: String,
    side: OrderSide,
    target: Decimal,
    interval: Duration,
    price_limit: Option<Decimal>,
    max_consecutive_skips: u32,
    slice_count: u32,
    slice_quantity: Decimal,
    last_slice_quantity: Decimal,

    slices_sent: u32,
    next_due: Option<DateTime<Utc>>,
    consecutive_skips: u32,
    total_skips: u32,
    /// Quantity sent and not released by a cancellation
    committed: Decimal,
    /// Unfilled quantity of cancelled slices, added to the next slice
    carry: Decimal,
    filled: Decimal,
    filled_value: Decimal,
}

impl TwapStrategy {
    pub fn new(
        ids: OrderIdAllocator,
        symbol: impl Into<String>,
        side: OrderSide,
        target: Decimal,
        params: &TwapParams,
        quantity_precision: u32,
        default_max_skips: u32,
    ) -> Self {
        let slice_count = params.slices.max(1);
        let slice_quantity = (target / Decimal::from(slice_count))
            .round_dp_with_strategy(quantity_precision, RoundingStrategy::ToZero);
        let last_slice_quantity = target - slice_quantity * Decimal::from(slice_count - 1);

        Self {
            ids,
            symbol: symbol.into(),
            side,
            target,
            interval: Duration::seconds(
                i64::try_from(params.interval_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000),
            ),
            price_limit: params.price_limit,
            max_consecutive_skips: params
                .max_consecutive_skips
                .unwrap_or(default_max_skips)
                .max(1),
            slice_count,
            slice_quantity,
            last_slice_quantity,
            slices_sent: 0,
            next_due: None,
            consecutive_skips: 0,
            total_skips: 0,
            committed: Decimal::ZERO,
            carry: Decimal::ZERO,
            filled: Decimal::ZERO,
            filled_value: Decimal::ZERO,
        }
    }

    /// Average execution price so far
    pub fn average_price(&self) -> Option<Decimal> {
        (self.filled > Decimal::ZERO).then(|| self.filled_value / self.filled)
    }

    /// Quantity of the next slice, or `None` when nothing is left to send
    fn next_slice(&self) -> Option<Decimal> {
        let scheduled = if self.slices_sent + 1 < self.slice_count {
            self.slice_quantity
        } else if self.slices_sent + 1 == self.slice_count {
            self.last_slice_quantity
        } else {
            Decimal::ZERO
        };
        let quantity = (scheduled + self.carry).min(self.target - self.committed);
        (quantity > Decimal::ZERO).then_some(quantity)
    }

    fn skip(&mut self, reason: String) -> StrategyAction {
        self.consecutive_skips += 1;
        self.total_skips += 1;
        warn!(
            "TWAP {} slice {} skipped ({}/{}): {}",
            self.ids.strategy(),
            self.slices_sent + 1,
            self.consecutive_skips,
            self.max_consecutive_skips,
            reason
        );

        if self.consecutive_skips >= self.max_consecutive_skips {
            return StrategyAction::fail(format!(
                "{} consecutive slices skipped: {}",
                self.consecutive_skips, reason
            ));
        }
        StrategyAction::none()
    }
}

impl Strategy for TwapStrategy {
    fn name(&self) -> &'static str {
        "twap"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn side(&self) -> OrderSide {
        self.side
    }

    fn target_quantity(&self) -> Decimal {
        self.target
    }

    fn on_tick(&mut self, now: DateTime<Utc>, market: &dyn MarketData) -> StrategyAction {
        if self.next_due.map_or(false, |due| now < due) {
            return StrategyAction::none();
        }
        let Some(quantity) = self.next_slice() else {
            return StrategyAction::none();
        };

        let Some(price) = market.last_price(&self.symbol) else {
            return self.skip(format!("no market data for {}", self.symbol));
        };
        if let Some(limit) = self.price_limit {
            let breached = match self.side {
                OrderSide::Buy => price > limit,
                OrderSide::Sell => price < limit,
            };
            if breached {
                return self.skip(format!("price {} beyond limit {}", price, limit));
            }
        }

        self.consecutive_skips = 0;
        self.carry = Decimal::ZERO;
        self.committed += quantity;
        if self.slices_sent < self.slice_count {
            self.slices_sent += 1;
        }
        self.next_due = Some(now + self.interval);

        let id = self.ids.next_id();
        info!(
            "TWAP {} slice {}/{}: {} {} {} (~{})",
            self.ids.strategy(),
            self.slices_sent,
            self.slice_count,
            self.side,
            quantity,
            self.symbol,
            price
        );
        StrategyAction::single(OrderRequest::market(id, self.symbol.clone(), self.side, quantity))
    }

    fn on_order_event(&mut self, order: &Order, fill: Option<&FillEvent>) -> StrategyAction {
        if let Some(fill) = fill {
            self.filled += fill.quantity;
            self.filled_value += fill.value();
        }

        if order.state.is_terminal() {
            let unfilled = order.remaining();
            if unfilled > Decimal::ZERO {
                info!(
                    "TWAP {} slice {} ended with {} unfilled; carrying to next slice",
                    self.ids.strategy(),
                    order.client_order_id,
                    unfilled
                );
                self.committed -= unfilled;
                self.carry += unfilled;
            }
        }
        StrategyAction::none()
    }

    fn is_complete(&self) -> bool {
        self.filled >= self.target
    }

    fn details(&self) -> Value {
        json!({
            "slices_sent": self.slices_sent,
            "slice_count": self.slice_count,
            "slice_quantity": self.slice_quantity,
            "skips": self.total_skips,
            "carry": self.carry,
            "average_price": self.average_price(),
        })
    }
}
