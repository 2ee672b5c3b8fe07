//! Exchange gateway abstraction - lets the runner drive a real exchange,
//! the paper simulator, or a test double through one interface

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::errors::Result;
use crate::order::{OrderAck, OrderId, OrderRequest, OrderUpdate};

/// Exchange operations used by the engine runner
///
/// Failures that may succeed on retry are reported as
/// [`Error::TransientGateway`](crate::Error::TransientGateway); an order the
/// exchange refuses is reported as [`Error::RejectedOrder`](crate::Error::RejectedOrder).
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit an order; returns the exchange-assigned id
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Request cancellation of a working order
    ///
    /// Success means the exchange accepted the request; the terminal state
    /// still arrives on the update stream.
    async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> Result<()>;

    /// Last traded price for a symbol
    async fn last_price(&self, symbol: &str) -> Result<Decimal>;

    /// Stream of order updates (state changes and fills)
    async fn subscribe(&self) -> Result<UnboundedReceiver<OrderUpdate>>;
}
