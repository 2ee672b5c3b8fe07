//! Strategy action types

use crate::order::{ClientOrderId, OrderRequest};

/// Action returned by a strategy in response to a tick or an order event
///
/// Lists orders to place and orders to cancel. The strategy doesn't know or
/// care how these are executed; the engine tracks them and turns them into
/// intents for the gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyAction {
    /// Orders to be placed on the market
    pub orders: Vec<OrderRequest>,
    /// Working orders to cancel
    pub cancels: Vec<ClientOrderId>,
    /// One-cancels-the-other pairs among `orders`
    pub links: Vec<(ClientOrderId, ClientOrderId)>,
    /// Set when the strategy cannot continue
    pub failure: Option<String>,
}

impl StrategyAction {
    /// Create an empty action (no orders)
    pub fn none() -> Self {
        Self::default()
    }

    /// Create an action with a single order
    pub fn single(order: OrderRequest) -> Self {
        Self {
            orders: vec![order],
            ..Self::default()
        }
    }

    /// Create an action with multiple orders
    pub fn multiple(orders: Vec<OrderRequest>) -> Self {
        Self {
            orders,
            ..Self::default()
        }
    }

    /// Two orders where a fill on either cancels the other
    pub fn linked_pair(first: OrderRequest, second: OrderRequest) -> Self {
        let link = (first.client_order_id, second.client_order_id);
        Self {
            orders: vec![first, second],
            links: vec![link],
            ..Self::default()
        }
    }

    /// Stop the strategy
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Check if this action has any orders
    pub fn has_orders(&self) -> bool {
        !self.orders.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.cancels.is_empty() && self.failure.is_none()
    }

    /// Add a cancel to this action (builder pattern)
    pub fn with_cancel(mut self, client_order_id: ClientOrderId) -> Self {
        self.cancels.push(client_order_id);
        self
    }

    /// Merge another action into this one; the first failure wins
    pub fn merge(mut self, other: StrategyAction) -> Self {
        self.orders.extend(other.orders);
        self.cancels.extend(other.cancels);
        self.links.extend(other.links);
        if self.failure.is_none() {
            self.failure = other.failure;
        }
        self
    }

    /// The OCO partner of an order in this action, if linked
    pub fn sibling_of(&self, client_order_id: ClientOrderId) -> Option<ClientOrderId> {
        self.links.iter().find_map(|(a, b)| {
            if *a == client_order_id {
                Some(*b)
            } else if *b == client_order_id {
                Some(*a)
            } else {
                None
            }
        })
    }
}

impl From<Option<OrderRequest>> for StrategyAction {
    fn from(order: Option<OrderRequest>) -> Self {
        match order {
            Some(o) => Self::single(o),
            None => Self::none(),
        }
    }
}
