//! Error types for the strategy engine and its gateway

use thiserror::Error;

use crate::order::{ClientOrderId, OrderId, StrategyId};

/// Errors that can occur while running strategies against an exchange
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid strategy spec: {0}")]
    InvalidStrategySpec(String),

    #[error("Order {client_order_id} rejected: {reason}")]
    RejectedOrder {
        client_order_id: ClientOrderId,
        reason: String,
    },

    #[error("Transient gateway error: {0}")]
    TransientGateway(String),

    #[error("Gateway call failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Duplicate update for order {order_id}: {detail}")]
    DuplicateUpdate { order_id: OrderId, detail: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Strategy not found: {0}")]
    StrategyNotFound(StrategyId),

    #[error("Strategy {id} is in invalid state for operation: {current_state}")]
    InvalidState {
        id: StrategyId,
        current_state: String,
    },

    #[error("No market price available for {0}")]
    NoMarketData(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State persistence error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl Error {
    /// Whether retrying the same gateway call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientGateway(_))
    }

    /// Whether this error is a duplicate notification that should be ignored
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateUpdate { .. })
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed(err.to_string())
    }
}

/// Result type for engine and gateway operations
pub type Result<T> = std::result::Result<T, Error>;
