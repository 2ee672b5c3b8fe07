//! Strategy status and the serializable views of engine state

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::order::{OrderSide, StrategyId};

/// Strategy lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    /// Submitted; no order placed yet
    Pending,
    Active,
    /// Some but not all of the target quantity has executed
    PartiallyFilled,
    /// Cancel requested; waiting for working orders to end
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl StrategyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Completed | StrategyStatus::Cancelled | StrategyStatus::Failed
        )
    }

    /// Whether the strategy's own logic still runs on ticks and events
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Pending | StrategyStatus::Active | StrategyStatus::PartiallyFilled
        )
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyStatus::Pending => "pending",
            StrategyStatus::Active => "active",
            StrategyStatus::PartiallyFilled => "partially_filled",
            StrategyStatus::Cancelling => "cancelling",
            StrategyStatus::Completed => "completed",
            StrategyStatus::Cancelled => "cancelled",
            StrategyStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub id: StrategyId,
    pub kind: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: StrategyStatus,
    pub target_quantity: Decimal,
    pub filled_quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<Decimal>,
    pub working_orders: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

/// Serializable engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub strategies: Vec<StrategySummary>,
    pub live_orders: usize,
    pub archived_orders: usize,
}

impl EngineSnapshot {
    /// Save to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn strategy(&self, id: StrategyId) -> Option<&StrategySummary> {
        self.strategies.iter().find(|s| s.id == id)
    }
}
