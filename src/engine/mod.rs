//! Strategy engine, its async runner and the status types they report

mod engine;
mod market_data;
mod runner;
mod status;

pub use engine::{OrderIntent, StrategyEngine};
pub use market_data::{MarketData, PriceBook};
pub use runner::{EngineCommand, EngineHandle, EngineRunner};
pub use status::{EngineSnapshot, StrategyStatus, StrategySummary};
