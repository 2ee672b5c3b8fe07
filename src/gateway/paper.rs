//! Paper trading gateway
//!
//! Simulates order execution locally by checking the last price against
//! working order limits and stop triggers. Prices are pushed in through
//! [`PaperGateway::set_price`], either from a live feed or a random walk.
//!
//! Margin is checked the same way for both sides: an order's notional must
//! fit in the quote balance minus the notional already held by resting
//! orders. Fills settle in cash, so buys debit the balance and sells credit it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::ExchangeGateway;
use crate::config::PaperConfig;
use crate::errors::{Error, Result};
use crate::order::{
    FillEvent, OrderAck, OrderId, OrderKind, OrderRequest, OrderSide, OrderState, OrderUpdate,
};

/// Paper trading position tracking
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperPosition {
    /// Position size (positive = long, negative = short)
    pub size: Decimal,
    pub entry_price: Decimal,
    pub realized_pnl: Decimal,
}

impl PaperPosition {
    fn apply_fill(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        if self.size.is_zero() {
            self.size = signed;
            self.entry_price = price;
        } else if self.size.is_sign_positive() == signed.is_sign_positive() {
            let total_value = self.entry_price * self.size.abs() + price * quantity;
            self.size += signed;
            self.entry_price = total_value / self.size.abs();
        } else {
            let closed = quantity.min(self.size.abs());
            let pnl = if self.size.is_sign_positive() {
                (price - self.entry_price) * closed
            } else {
                (self.entry_price - price) * closed
            };
            self.realized_pnl += pnl;
            self.size += signed;

            if self.size.is_zero() {
                self.entry_price = Decimal::ZERO;
            } else if quantity > closed {
                // Flipped through zero; the remainder opened at this price
                self.entry_price = price;
            }
        }
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.size
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
    filled: Decimal,
    triggered: bool,
}

impl PaperOrder {
    fn new(request: OrderRequest) -> Self {
        let triggered = !request.kind.is_stop();
        Self {
            request,
            state: OrderState::Open,
            filled: Decimal::ZERO,
            triggered,
        }
    }

    fn remaining(&self) -> Decimal {
        self.request.quantity - self.filled
    }

    /// Notional held while the order rests on the book
    fn reserved(&self) -> Decimal {
        if self.state != OrderState::Open {
            return Decimal::ZERO;
        }
        let price = self
            .request
            .kind
            .limit_price()
            .or(self.request.kind.stop_price())
            .unwrap_or(Decimal::ZERO);
        self.remaining() * price
    }

    /// Check if this order executes at the given price, arming stops first
    fn should_fill(&mut self, price: Decimal) -> bool {
        if self.state != OrderState::Open {
            return false;
        }

        if !self.triggered {
            let Some(stop) = self.request.kind.stop_price() else {
                return false;
            };
            self.triggered = match self.request.side {
                OrderSide::Buy => price >= stop,
                OrderSide::Sell => price <= stop,
            };
            if !self.triggered {
                return false;
            }
            debug!("Paper stop {} triggered at {}", self.request.client_order_id, price);
        }

        match self.request.kind.limit_price() {
            None => true,
            Some(limit) => match self.request.side {
                OrderSide::Buy => price <= limit,
                OrderSide::Sell => price >= limit,
            },
        }
    }
}

struct PaperBook {
    prices: HashMap<String, Decimal>,
    orders: BTreeMap<OrderId, PaperOrder>,
    positions: HashMap<String, PaperPosition>,
    balance: Decimal,
    total_fees: Decimal,
    fee_rate: Decimal,
    sequence: u64,
    subscribers: Vec<UnboundedSender<OrderUpdate>>,
}

impl PaperBook {
    fn available(&self) -> Decimal {
        self.balance - self.orders.values().map(PaperOrder::reserved).sum::<Decimal>()
    }

    fn publish(&mut self, order_id: OrderId, state: OrderState, fill: Option<FillEvent>) {
        self.sequence += 1;
        let update = OrderUpdate {
            order_id,
            sequence: self.sequence,
            state,
            fill,
        };
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn match_orders(&mut self, symbol: &str, price: Decimal) {
        let executable: Vec<OrderId> = self
            .orders
            .iter_mut()
            .filter(|(_, order)| order.request.symbol == symbol)
            .filter_map(|(id, order)| order.should_fill(price).then_some(*id))
            .collect();

        for order_id in executable {
            self.execute_fill(order_id, price);
        }
    }

    fn execute_fill(&mut self, order_id: OrderId, price: Decimal) {
        let Some(order) = self.orders.get_mut(&order_id) else {
            return;
        };

        let quantity = order.remaining();
        order.filled += quantity;
        order.state = OrderState::Filled;
        let side = order.request.side;
        let symbol = order.request.symbol.clone();

        let notional = quantity * price;
        let fee = notional * self.fee_rate;
        match side {
            OrderSide::Buy => self.balance -= notional + fee,
            OrderSide::Sell => self.balance += notional - fee,
        }
        self.total_fees += fee;
        self.positions
            .entry(symbol.clone())
            .or_default()
            .apply_fill(side, quantity, price);

        info!(
            "Paper fill: {} {} {} at {} (fee: {})",
            side,
            quantity,
            symbol,
            price,
            fee.round_dp(4)
        );

        let fill = FillEvent::new(Uuid::new_v4().to_string(), quantity, price);
        self.publish(order_id, OrderState::Filled, Some(fill));
    }
}

/// Simulated exchange with local matching
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    next_order_id: AtomicU64,
}

impl PaperGateway {
    pub fn new(quote_balance: Decimal) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                prices: HashMap::new(),
                orders: BTreeMap::new(),
                positions: HashMap::new(),
                balance: quote_balance,
                total_fees: Decimal::ZERO,
                fee_rate: dec!(0.0004),
                sequence: 0,
                subscribers: Vec::new(),
            }),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &PaperConfig) -> Self {
        Self::new(config.quote_balance)
    }

    /// Update the price for a symbol and execute any orders it crosses
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut book = self.book.lock().await;
        book.prices.insert(symbol.to_string(), price);
        book.match_orders(symbol, price);
    }

    /// Remaining quote balance
    pub async fn balance(&self) -> Decimal {
        self.book.lock().await.balance
    }

    pub async fn total_fees(&self) -> Decimal {
        self.book.lock().await.total_fees
    }

    pub async fn position(&self, symbol: &str) -> Option<PaperPosition> {
        self.book.lock().await.positions.get(symbol).cloned()
    }

    /// Number of orders still resting on the simulated book
    pub async fn open_order_count(&self) -> usize {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.state == OrderState::Open)
            .count()
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let reject = |reason: &str| Error::RejectedOrder {
            client_order_id: request.client_order_id,
            reason: reason.to_string(),
        };

        if !request.is_valid() {
            return Err(reject("invalid quantity or price"));
        }

        let mut book = self.book.lock().await;
        let last = book.prices.get(&request.symbol).copied();
        let reference = request
            .kind
            .limit_price()
            .or(request.kind.stop_price())
            .or(last)
            .ok_or_else(|| reject("no market price"))?;

        if request.quantity * reference > book.available() {
            return Err(reject("insufficient balance"));
        }

        let order_id = OrderId(self.next_order_id.fetch_add(1, Ordering::SeqCst));
        info!(
            "Paper order {}: {} {} {} {}{}",
            order_id,
            request.kind.name(),
            request.side,
            request.quantity,
            request.symbol,
            request
                .price()
                .map(|p| format!(" @ {}", p))
                .unwrap_or_default()
        );

        book.orders.insert(order_id, PaperOrder::new(request.clone()));
        book.publish(order_id, OrderState::Open, None);

        if let Some(price) = last {
            let executes = book
                .orders
                .get_mut(&order_id)
                .map_or(false, |order| order.should_fill(price));
            if executes {
                book.execute_fill(order_id, price);
            }
        }

        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: OrderId) -> Result<()> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::OrderNotFound(format!("exchange order {}", order_id)))?;

        if order.state != OrderState::Open {
            return Err(Error::OrderNotFound(format!(
                "exchange order {} is {}",
                order_id, order.state
            )));
        }

        order.state = OrderState::Cancelled;
        info!("Paper order {} cancelled", order_id);
        book.publish(order_id, OrderState::Cancelled, None);
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal> {
        self.book
            .lock()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::NoMarketData(symbol.to_string()))
    }

    async fn subscribe(&self) -> Result<UnboundedReceiver<OrderUpdate>> {
        let (tx, rx) = unbounded_channel();
        self.book.lock().await.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{ClientOrderId, StrategyId};

    fn cid(seq: u32) -> ClientOrderId {
        ClientOrderId::new(StrategyId(1), seq)
    }

    #[tokio::test]
    async fn test_limit_fills_when_price_crosses() {
        let gateway = PaperGateway::new(dec!(100000));
        let mut updates = gateway.subscribe().await.unwrap();
        gateway.set_price("BTCUSDT", dec!(105)).await;

        let request = OrderRequest::limit(cid(1), "BTCUSDT", OrderSide::Buy, dec!(1), dec!(100));
        let ack = gateway.place_order(&request).await.unwrap();

        let open = updates.recv().await.unwrap();
        assert_eq!(open.order_id, ack.order_id);
        assert_eq!(open.state, OrderState::Open);
        assert!(open.fill.is_none());

        gateway.set_price("BTCUSDT", dec!(101)).await;
        assert!(updates.try_recv().is_err());

        gateway.set_price("BTCUSDT", dec!(99.5)).await;
        let filled = updates.recv().await.unwrap();
        assert_eq!(filled.state, OrderState::Filled);
        assert!(filled.sequence > open.sequence);
        let fill = filled.fill.unwrap();
        assert_eq!(fill.quantity, dec!(1));
        assert_eq!(fill.price, dec!(99.5));

        let position = gateway.position("BTCUSDT").await.unwrap();
        assert_eq!(position.size, dec!(1));
        assert_eq!(gateway.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let gateway = PaperGateway::new(dec!(100000));
        let mut updates = gateway.subscribe().await.unwrap();
        gateway.set_price("ETHUSDT", dec!(2000)).await;

        let request = OrderRequest::market(cid(1), "ETHUSDT", OrderSide::Sell, dec!(0.5));
        gateway.place_order(&request).await.unwrap();

        assert_eq!(updates.recv().await.unwrap().state, OrderState::Open);
        let filled = updates.recv().await.unwrap();
        assert_eq!(filled.fill.unwrap().price, dec!(2000));
    }

    #[tokio::test]
    async fn test_stop_market_triggers_on_fall() {
        let gateway = PaperGateway::new(dec!(100000));
        let mut updates = gateway.subscribe().await.unwrap();
        gateway.set_price("BTCUSDT", dec!(100)).await;

        let request = OrderRequest::new(
            cid(1),
            "BTCUSDT",
            OrderSide::Sell,
            dec!(1),
            OrderKind::StopMarket { stop_price: dec!(95) },
        );
        gateway.place_order(&request).await.unwrap();
        updates.recv().await.unwrap();

        gateway.set_price("BTCUSDT", dec!(97)).await;
        assert!(updates.try_recv().is_err());

        gateway.set_price("BTCUSDT", dec!(94)).await;
        let filled = updates.recv().await.unwrap();
        assert_eq!(filled.state, OrderState::Filled);
        assert_eq!(filled.fill.unwrap().price, dec!(94));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let gateway = PaperGateway::new(dec!(50));
        let request = OrderRequest::limit(cid(7), "BTCUSDT", OrderSide::Buy, dec!(1), dec!(100));

        let err = gateway.place_order(&request).await.unwrap_err();
        match err {
            Error::RejectedOrder {
                client_order_id,
                reason,
            } => {
                assert_eq!(client_order_id, cid(7));
                assert_eq!(reason, "insufficient balance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_resting_orders_hold_margin() {
        let gateway = PaperGateway::new(dec!(150));
        gateway.set_price("BTCUSDT", dec!(105)).await;

        let first = OrderRequest::limit(cid(1), "BTCUSDT", OrderSide::Buy, dec!(1), dec!(100));
        let ack = gateway.place_order(&first).await.unwrap();

        let second = OrderRequest::limit(cid(2), "BTCUSDT", OrderSide::Sell, dec!(1), dec!(110));
        let err = gateway.place_order(&second).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RejectedOrder { ref reason, .. } if reason == "insufficient balance"
        ));

        gateway.cancel_order("BTCUSDT", ack.order_id).await.unwrap();
        assert!(gateway.place_order(&second).await.is_ok());
        assert_eq!(gateway.open_order_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_twice_fails() {
        let gateway = PaperGateway::new(dec!(100000));
        let mut updates = gateway.subscribe().await.unwrap();
        let request = OrderRequest::limit(cid(1), "BTCUSDT", OrderSide::Buy, dec!(1), dec!(100));
        let ack = gateway.place_order(&request).await.unwrap();

        gateway.cancel_order("BTCUSDT", ack.order_id).await.unwrap();
        assert!(gateway.cancel_order("BTCUSDT", ack.order_id).await.is_err());

        updates.recv().await.unwrap();
        assert_eq!(updates.recv().await.unwrap().state, OrderState::Cancelled);
    }

    #[test]
    fn test_position_round_trip_pnl() {
        let mut position = PaperPosition::default();
        position.apply_fill(OrderSide::Buy, dec!(2), dec!(100));
        position.apply_fill(OrderSide::Sell, dec!(1), dec!(110));
        assert_eq!(position.size, dec!(1));
        assert_eq!(position.realized_pnl, dec!(10));
        assert_eq!(position.unrealized_pnl(dec!(105)), dec!(5));
    }
}
