#![deny(unreachable_pub)]
pub mod config;
pub mod engine;
mod errors;
pub mod gateway;
pub mod order;
pub mod strategy;

pub use config::Settings;
pub use engine::{EngineHandle, EngineRunner, StrategyEngine, StrategyStatus};
pub use errors::{Error, Result};
pub use gateway::{ExchangeGateway, PaperGateway};
pub use strategy::StrategySpec;
