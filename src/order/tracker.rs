//! Order tracker - maps exchange order ids to local orders and applies updates

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rust_decimal::Decimal;

use super::types::{
    ClientOrderId, FillEvent, Order, OrderId, OrderRequest, OrderState, OrderUpdate, StrategyId,
};
use crate::errors::{Error, Result};

/// Outcome of applying an update to a tracked order
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub client_order_id: ClientOrderId,
    pub strategy_id: StrategyId,
    pub previous: OrderState,
    pub state: OrderState,
    /// The fill as recorded (clamped to the remaining quantity)
    pub fill: Option<FillEvent>,
    /// A fill that was dropped because this OCO leg lost the race to its sibling
    pub discarded_fill: Option<FillEvent>,
}

impl AppliedUpdate {
    /// Whether this update moved the order into a terminal state
    pub fn became_terminal(&self) -> bool {
        !self.previous.is_terminal() && self.state.is_terminal()
    }
}

/// Executed quantity and quote value summed over a set of orders
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FillTotals {
    pub quantity: Decimal,
    pub value: Decimal,
}

impl FillTotals {
    fn add(&mut self, order: &Order) {
        self.quantity += order.filled_quantity;
        self.value += order.filled_quantity * order.avg_fill_price;
    }

    pub fn average_price(&self) -> Option<Decimal> {
        (self.quantity > Decimal::ZERO).then(|| self.value / self.quantity)
    }
}

/// Tracks every order the engine has emitted
///
/// Live orders are keyed by client order id in a `BTreeMap` so that iteration
/// (and therefore intent ordering) is deterministic. Terminal orders are moved
/// to the archive once the owning strategy has seen their final event; the
/// exchange id index keeps pointing at them so late duplicates are recognised.
/// Archived orders can be pruned after a retention window; their fills are
/// folded into per-strategy totals first.
#[derive(Debug, Default)]
pub struct OrderTracker {
    live: BTreeMap<ClientOrderId, Order>,
    archived: HashMap<ClientOrderId, Order>,
    by_exchange_id: HashMap<OrderId, ClientOrderId>,
    pruned: HashMap<StrategyId, FillTotals>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly emitted order intent (state `New`)
    pub fn track(&mut self, request: OrderRequest, sibling: Option<ClientOrderId>) -> &Order {
        let client_order_id = request.client_order_id;
        let mut order = Order::new(request);
        order.sibling = sibling;
        self.live.entry(client_order_id).or_insert(order)
    }

    /// Bind the exchange order id returned on submission to the tracked order
    ///
    /// Returns the owning strategy. The order moves from `New` to `Open`.
    pub fn register(&mut self, client_order_id: ClientOrderId, order_id: OrderId) -> Result<StrategyId> {
        if let Some(existing) = self.by_exchange_id.get(&order_id) {
            if *existing != client_order_id {
                return Err(Error::InvalidState {
                    id: client_order_id.strategy,
                    current_state: format!("exchange id {} already bound to {}", order_id, existing),
                });
            }
        }

        let order = self
            .live
            .get_mut(&client_order_id)
            .ok_or_else(|| Error::OrderNotFound(client_order_id.to_string()))?;

        order.order_id = Some(order_id);
        if order.state == OrderState::New {
            order.state = OrderState::Open;
        }
        order.updated_at = Utc::now();
        self.by_exchange_id.insert(order_id, client_order_id);

        debug!("Registered {} as exchange order {}", client_order_id, order_id);
        Ok(client_order_id.strategy)
    }

    /// Apply an exchange update idempotently
    ///
    /// Duplicates (a fill id seen before, a stale sequence number, or anything
    /// addressed to a terminal order) return `Error::DuplicateUpdate` and leave
    /// the order untouched.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> Result<AppliedUpdate> {
        let client_order_id = *self
            .by_exchange_id
            .get(&update.order_id)
            .ok_or_else(|| Error::OrderNotFound(format!("exchange order {}", update.order_id)))?;

        if let Some(archived) = self.archived.get(&client_order_id) {
            return Err(Error::DuplicateUpdate {
                order_id: update.order_id,
                detail: format!("order already archived as {}", archived.state),
            });
        }

        let sibling_filled = self
            .live
            .get(&client_order_id)
            .and_then(|order| order.sibling)
            .and_then(|sibling| self.get(&sibling))
            .map_or(false, |sibling| sibling.filled_quantity > Decimal::ZERO);

        let order = self
            .live
            .get_mut(&client_order_id)
            .ok_or_else(|| Error::OrderNotFound(client_order_id.to_string()))?;

        if order.state.is_terminal() {
            return Err(Error::DuplicateUpdate {
                order_id: update.order_id,
                detail: format!("order already {}", order.state),
            });
        }

        let previous = order.state;
        let mut recorded = None;
        let mut discarded = None;

        match &update.fill {
            Some(fill) => {
                if order.has_fill(&fill.fill_id) {
                    return Err(Error::DuplicateUpdate {
                        order_id: update.order_id,
                        detail: format!("fill {} already applied", fill.fill_id),
                    });
                }

                if order.cancel_requested && sibling_filled {
                    // The sibling leg already won; cancellation of this leg is in flight.
                    warn!(
                        "Discarding fill {} on OCO leg {}: sibling already filled",
                        fill.fill_id, client_order_id
                    );
                    order.discarded_fills.push(fill.clone());
                    order.state = OrderState::Cancelled;
                    order.cancel_requested = false;
                    discarded = Some(fill.clone());
                } else {
                    recorded = order.record_fill(fill);
                    if recorded.as_ref().map(|f| f.quantity) != Some(fill.quantity) {
                        warn!(
                            "Fill {} on {} exceeds remaining quantity; clamped to {}",
                            fill.fill_id,
                            client_order_id,
                            recorded.as_ref().map(|f| f.quantity).unwrap_or(Decimal::ZERO)
                        );
                    }
                    order.state = next_state(order, update.state);
                }
            }
            None => {
                if update.sequence <= order.last_sequence {
                    return Err(Error::DuplicateUpdate {
                        order_id: update.order_id,
                        detail: format!(
                            "sequence {} not after {}",
                            update.sequence, order.last_sequence
                        ),
                    });
                }
                order.state = next_state(order, update.state);
            }
        }

        if update.state == OrderState::Filled && order.state == OrderState::Open {
            debug!(
                "{} reported filled with {} of {} recorded; awaiting fills",
                client_order_id, order.filled_quantity, order.request.quantity
            );
        }
        if order.state.is_terminal() {
            order.cancel_requested = false;
        }
        order.last_sequence = order.last_sequence.max(update.sequence);
        order.updated_at = Utc::now();

        Ok(AppliedUpdate {
            client_order_id,
            strategy_id: client_order_id.strategy,
            previous,
            state: order.state,
            fill: recorded,
            discarded_fill: discarded,
        })
    }

    /// Force a terminal state decided locally (rejection, confirmed cancel)
    pub fn resolve(&mut self, client_order_id: ClientOrderId, state: OrderState) -> Result<AppliedUpdate> {
        let order = self
            .live
            .get_mut(&client_order_id)
            .ok_or_else(|| Error::OrderNotFound(client_order_id.to_string()))?;

        if order.state.is_terminal() {
            return Err(Error::DuplicateUpdate {
                order_id: order.order_id.unwrap_or(OrderId(0)),
                detail: format!("order already {}", order.state),
            });
        }

        let previous = order.state;
        order.state = state;
        order.cancel_requested = false;
        order.updated_at = Utc::now();

        Ok(AppliedUpdate {
            client_order_id,
            strategy_id: client_order_id.strategy,
            previous,
            state,
            fill: None,
            discarded_fill: None,
        })
    }

    /// Flag a working order for cancellation
    ///
    /// Returns the exchange id if a cancel can be sent now, `None` if the order
    /// has not been acknowledged yet (the cancel is sent on registration) or is
    /// already being cancelled.
    pub fn request_cancel(&mut self, client_order_id: ClientOrderId) -> Result<Option<OrderId>> {
        let order = self
            .live
            .get_mut(&client_order_id)
            .ok_or_else(|| Error::OrderNotFound(client_order_id.to_string()))?;

        if order.state.is_terminal() || order.cancel_requested {
            return Ok(None);
        }

        order.cancel_requested = true;
        Ok(order.order_id)
    }

    /// Clear a pending cancel flag after the exchange refused the cancel
    ///
    /// A losing OCO leg keeps the flag: the refusal usually means it already
    /// executed, and that fill must still be discarded when it arrives.
    pub fn cancel_refused(&mut self, client_order_id: ClientOrderId) {
        let sibling_filled = self
            .live
            .get(&client_order_id)
            .and_then(|order| order.sibling)
            .and_then(|sibling| self.get(&sibling))
            .map_or(false, |sibling| sibling.filled_quantity > Decimal::ZERO);

        if let Some(order) = self.live.get_mut(&client_order_id) {
            if !sibling_filled {
                order.cancel_requested = false;
            }
        }
    }

    /// Move a terminal order out of the live set
    pub fn archive(&mut self, client_order_id: ClientOrderId) -> bool {
        match self.live.get(&client_order_id) {
            Some(order) if order.state.is_terminal() => {
                if let Some(order) = self.live.remove(&client_order_id) {
                    self.archived.insert(client_order_id, order);
                }
                true
            }
            _ => false,
        }
    }

    /// Look up an order, live or archived
    pub fn get(&self, client_order_id: &ClientOrderId) -> Option<&Order> {
        self.live
            .get(client_order_id)
            .or_else(|| self.archived.get(client_order_id))
    }

    /// Non-terminal orders of a strategy, in client id order
    pub fn working_orders(&self, strategy_id: StrategyId) -> impl Iterator<Item = &Order> {
        self.live
            .range(ClientOrderId::new(strategy_id, 0)..=ClientOrderId::new(strategy_id, u32::MAX))
            .map(|(_, order)| order)
            .filter(|order| !order.state.is_terminal())
    }

    pub fn has_working_orders(&self, strategy_id: StrategyId) -> bool {
        self.working_orders(strategy_id).next().is_some()
    }

    /// All orders ever emitted by a strategy, live and archived
    pub fn orders_for(&self, strategy_id: StrategyId) -> Vec<&Order> {
        let mut orders: Vec<&Order> = self
            .live
            .values()
            .chain(self.archived.values())
            .filter(|o| o.strategy_id() == strategy_id)
            .collect();
        orders.sort_by_key(|o| o.client_order_id);
        orders
    }

    /// Fill totals of a strategy, including orders already pruned
    pub fn fill_totals(&self, strategy_id: StrategyId) -> FillTotals {
        let mut totals = self.pruned.get(&strategy_id).copied().unwrap_or_default();
        for order in self.orders_for(strategy_id) {
            totals.add(order);
        }
        totals
    }

    /// Drop archived orders last updated before `cutoff`
    ///
    /// An archived OCO leg is kept while its sibling is live. Updates for a
    /// pruned exchange id are reported as unknown afterwards.
    pub fn prune_archived(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<ClientOrderId> = self
            .archived
            .values()
            .filter(|order| order.updated_at < cutoff)
            .filter(|order| order.sibling.map_or(true, |s| !self.live.contains_key(&s)))
            .map(|order| order.client_order_id)
            .collect();

        for client_order_id in &expired {
            if let Some(order) = self.archived.remove(client_order_id) {
                if let Some(order_id) = order.order_id {
                    self.by_exchange_id.remove(&order_id);
                }
                self.pruned.entry(order.strategy_id()).or_default().add(&order);
            }
        }

        if !expired.is_empty() {
            debug!("Pruned {} archived orders", expired.len());
        }
        expired.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }
}

/// Resolve the state an order moves to
///
/// An open order never regresses to `New`, and only becomes `Filled` once its
/// recorded fills cover the quantity; until then the missing fills are still
/// expected on the stream.
fn next_state(order: &Order, reported: OrderState) -> OrderState {
    if order.is_fully_filled() {
        return OrderState::Filled;
    }
    match reported {
        OrderState::New | OrderState::Filled => OrderState::Open,
        other => other,
    }
}
