//! Core order data types shared by the engine, the tracker and the gateways

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Engine-assigned strategy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId(pub u64);

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Exchange-assigned order identifier (known only after submission)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally assigned order identifier
///
/// Composed of the owning strategy and a per-strategy sequence number, so the
/// owner of any order can be recovered from its id alone. Strategies allocate
/// these themselves, the same way they pick ids for the requests they return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientOrderId {
    pub strategy: StrategyId,
    pub seq: u32,
}

impl ClientOrderId {
    pub fn new(strategy: StrategyId, seq: u32) -> Self {
        Self { strategy, seq }
    }

    pub fn strategy_id(&self) -> StrategyId {
        self.strategy
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.strategy, self.seq)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => Ok(OrderSide::Buy),
            "S" | "SELL" => Ok(OrderSide::Sell),
            other => Err(Error::InvalidStrategySpec(format!(
                "side must be BUY or SELL, got '{}'",
                other
            ))),
        }
    }
}

/// How an order executes on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderKind {
    /// Executes immediately at the best available price
    Market,
    /// Rests on the book at `price`
    Limit { price: Decimal },
    /// Becomes a market order once the last price crosses `stop_price`
    StopMarket { stop_price: Decimal },
    /// Becomes a limit order at `price` once the last price crosses `stop_price`
    StopLimit { stop_price: Decimal, price: Decimal },
}

impl OrderKind {
    /// Limit price, if the order carries one
    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderKind::Limit { price } | OrderKind::StopLimit { price, .. } => Some(*price),
            OrderKind::Market | OrderKind::StopMarket { .. } => None,
        }
    }

    /// Trigger price for stop orders
    pub fn stop_price(&self) -> Option<Decimal> {
        match self {
            OrderKind::StopMarket { stop_price } | OrderKind::StopLimit { stop_price, .. } => {
                Some(*stop_price)
            }
            OrderKind::Market | OrderKind::Limit { .. } => None,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.stop_price().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit { .. } => "LIMIT",
            OrderKind::StopMarket { .. } => "STOP_MARKET",
            OrderKind::StopLimit { .. } => "STOP",
        }
    }
}

/// An order a strategy wants placed on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
}

impl OrderRequest {
    pub fn new(
        client_order_id: ClientOrderId,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        kind: OrderKind,
    ) -> Self {
        Self {
            client_order_id,
            symbol: symbol.into(),
            side,
            quantity,
            kind,
        }
    }

    /// Create a limit order request
    pub fn limit(
        client_order_id: ClientOrderId,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self::new(client_order_id, symbol, side, quantity, OrderKind::Limit { price })
    }

    /// Create a market order request
    pub fn market(
        client_order_id: ClientOrderId,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
    ) -> Self {
        Self::new(client_order_id, symbol, side, quantity, OrderKind::Market)
    }

    pub fn strategy_id(&self) -> StrategyId {
        self.client_order_id.strategy
    }

    /// Limit price, if any
    pub fn price(&self) -> Option<Decimal> {
        self.kind.limit_price()
    }

    pub fn is_valid(&self) -> bool {
        self.quantity > Decimal::ZERO
            && self.kind.limit_price().map_or(true, |p| p > Decimal::ZERO)
            && self.kind.stop_price().map_or(true, |p| p > Decimal::ZERO)
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
}

/// Lifecycle state of an exchange-facing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderState {
    /// Created locally, not yet acknowledged by the exchange
    New,
    /// Acknowledged and working (possibly partially filled)
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::New => "NEW",
            OrderState::Open => "OPEN",
            OrderState::Filled => "FILLED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Quantity executed at a price; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Exchange trade identifier, unique per fill
    pub fill_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    pub fn new(fill_id: impl Into<String>, quantity: Decimal, price: Decimal) -> Self {
        Self {
            fill_id: fill_id.into(),
            quantity,
            price,
            timestamp: Utc::now(),
        }
    }

    /// Quote value of this fill
    pub fn value(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Order state notification delivered by the gateway stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    /// Monotonically increasing per exchange stream
    pub sequence: u64,
    pub state: OrderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<FillEvent>,
}

impl OrderUpdate {
    /// A state change without an execution
    pub fn state(order_id: OrderId, sequence: u64, state: OrderState) -> Self {
        Self {
            order_id,
            sequence,
            state,
            fill: None,
        }
    }

    /// An execution, with the order state after it
    pub fn fill(order_id: OrderId, sequence: u64, state: OrderState, fill: FillEvent) -> Self {
        Self {
            order_id,
            sequence,
            state,
            fill: Some(fill),
        }
    }
}

/// One exchange-facing order owned by a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    pub request: OrderRequest,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub fills: Vec<FillEvent>,
    /// A cancel has been requested and not yet confirmed
    pub cancel_requested: bool,
    /// The other leg of a one-cancels-the-other pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling: Option<ClientOrderId>,
    /// Fills that arrived after this leg lost an OCO race
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discarded_fills: Vec<FillEvent>,
    pub last_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(request: OrderRequest) -> Self {
        Self {
            client_order_id: request.client_order_id,
            order_id: None,
            request,
            state: OrderState::New,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fills: Vec::new(),
            cancel_requested: false,
            sibling: None,
            discarded_fills: Vec::new(),
            last_sequence: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn strategy_id(&self) -> StrategyId {
        self.client_order_id.strategy
    }

    /// Quantity still open on the book
    pub fn remaining(&self) -> Decimal {
        (self.request.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.request.quantity
    }

    pub fn has_fill(&self, fill_id: &str) -> bool {
        self.fills.iter().any(|f| f.fill_id == fill_id)
            || self.discarded_fills.iter().any(|f| f.fill_id == fill_id)
    }

    /// Record a fill, clamped so the total never exceeds the requested quantity
    ///
    /// Returns the fill as recorded, or `None` when nothing was left to fill.
    pub(crate) fn record_fill(&mut self, fill: &FillEvent) -> Option<FillEvent> {
        let quantity = fill.quantity.min(self.remaining());
        if quantity <= Decimal::ZERO {
            return None;
        }

        let total_value = self.avg_fill_price * self.filled_quantity + fill.price * quantity;
        self.filled_quantity += quantity;
        self.avg_fill_price = total_value / self.filled_quantity;

        let recorded = FillEvent {
            fill_id: fill.fill_id.clone(),
            quantity,
            price: fill.price,
            timestamp: fill.timestamp,
        };
        self.fills.push(recorded.clone());
        Some(recorded)
    }
}
