use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use super::traits::ExchangeGateway;
use crate::errors::{Error, Result};
use crate::order::{OrderAck, OrderId, OrderRequest, OrderUpdate};

/// Scripted outcome for the next gateway call
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Fail with a retryable error
    Transient(String),
    /// Refuse the order
    Reject(String),
}

/// Mock exchange for testing
///
/// Records every call and hands out sequential exchange ids. Updates are
/// delivered only when a test pushes them.
pub struct MockGateway {
    pub placed: Arc<Mutex<Vec<(OrderId, OrderRequest)>>>,
    pub cancelled: Arc<Mutex<Vec<OrderId>>>,
    pub prices: Arc<Mutex<HashMap<String, Decimal>>>,
    place_script: Arc<Mutex<VecDeque<MockOutcome>>>,
    cancel_script: Arc<Mutex<VecDeque<MockOutcome>>>,
    subscribers: Arc<Mutex<Vec<UnboundedSender<OrderUpdate>>>>,
    next_oid: AtomicU64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            placed: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
            prices: Arc::new(Mutex::new(HashMap::new())),
            place_script: Arc::new(Mutex::new(VecDeque::new())),
            cancel_script: Arc::new(Mutex::new(VecDeque::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_oid: AtomicU64::new(1),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().await.insert(symbol.to_string(), price);
    }

    /// Queue an outcome for an upcoming `place_order` call
    pub async fn script_place(&self, outcome: MockOutcome) {
        self.place_script.lock().await.push_back(outcome);
    }

    /// Queue an outcome for an upcoming `cancel_order` call
    pub async fn script_cancel(&self, outcome: MockOutcome) {
        self.cancel_script.lock().await.push_back(outcome);
    }

    /// Deliver an update to every subscriber
    pub async fn push_update(&self, update: OrderUpdate) {
        self.subscribers
            .lock()
            .await
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Requests placed so far, in submission order
    pub async fn placed_requests(&self) -> Vec<OrderRequest> {
        self.placed
            .lock()
            .await
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// Exchange id assigned to a placed request
    pub async fn order_id_for(&self, request: &OrderRequest) -> Option<OrderId> {
        self.placed
            .lock()
            .await
            .iter()
            .find(|(_, r)| r.client_order_id == request.client_order_id)
            .map(|(id, _)| *id)
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        match self.place_script.lock().await.pop_front() {
            Some(MockOutcome::Transient(reason)) => return Err(Error::TransientGateway(reason)),
            Some(MockOutcome::Reject(reason)) => {
                return Err(Error::RejectedOrder {
                    client_order_id: request.client_order_id,
                    reason,
                })
            }
            None => {}
        }

        let order_id = OrderId(self.next_oid.fetch_add(1, Ordering::SeqCst));
        self.placed.lock().await.push((order_id, request.clone()));
        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: OrderId) -> Result<()> {
        match self.cancel_script.lock().await.pop_front() {
            Some(MockOutcome::Transient(reason)) => Err(Error::TransientGateway(reason)),
            Some(MockOutcome::Reject(reason)) => Err(Error::OrderNotFound(reason)),
            None => {
                self.cancelled.lock().await.push(order_id);
                Ok(())
            }
        }
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal> {
        self.prices
            .lock()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::NoMarketData(symbol.to_string()))
    }

    async fn subscribe(&self) -> Result<UnboundedReceiver<OrderUpdate>> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(rx)
    }
}
