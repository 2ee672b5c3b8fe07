//! Strategy specifications as submitted by callers, with validation

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::TradingLimits;
use crate::errors::{Error, Result};
use crate::order::OrderSide;

/// Which initial orders a grid places
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GridDirection {
    #[default]
    Both,
    BuyOnly,
    SellOnly,
}

impl GridDirection {
    pub fn allows(&self, side: OrderSide) -> bool {
        match self {
            GridDirection::Both => true,
            GridDirection::BuyOnly => side == OrderSide::Buy,
            GridDirection::SellOnly => side == OrderSide::Sell,
        }
    }
}

/// Price ladder of a grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GridLadder {
    /// Explicit price levels
    Levels { levels: Vec<Decimal> },
    /// Evenly spaced levels between two bounds, both included
    Range {
        lower_price: Decimal,
        upper_price: Decimal,
        grid_count: u32,
    },
}

impl GridLadder {
    /// Ascending prices, rounded to the configured tick precision
    pub fn prices(&self, limits: &TradingLimits) -> Vec<Decimal> {
        let mut prices: Vec<Decimal> = match self {
            GridLadder::Levels { levels } => levels.iter().map(|p| limits.round_price(*p)).collect(),
            GridLadder::Range {
                lower_price,
                upper_price,
                grid_count,
            } => {
                let steps = Decimal::from(grid_count.saturating_sub(1).max(1));
                let gap = (*upper_price - *lower_price) / steps;
                (0..*grid_count)
                    .map(|i| limits.round_price(*lower_price + gap * Decimal::from(i)))
                    .collect()
            }
        };
        prices.sort();
        prices.dedup();
        prices
    }

    fn level_count(&self) -> usize {
        match self {
            GridLadder::Levels { levels } => levels.len(),
            GridLadder::Range { grid_count, .. } => *grid_count as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    #[serde(flatten)]
    pub ladder: GridLadder,
    pub quantity_per_level: Decimal,
    #[serde(default)]
    pub direction: GridDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcoParams {
    /// Take-profit limit leg
    pub limit_price: Decimal,
    /// Trigger of the stop leg
    pub stop_price: Decimal,
    /// Stop-limit price; the stop leg is a stop-market order when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwapParams {
    pub slices: u32,
    pub interval_secs: u64,
    /// Worst acceptable price; slices are skipped while the market is beyond it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_limit: Option<Decimal>,
    /// Overrides the engine-wide limit on consecutive skipped slices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_skips: Option<u32>,
}

impl TwapParams {
    pub fn new(slices: u32, interval_secs: u64) -> Self {
        Self {
            slices,
            interval_secs,
            price_limit: None,
            max_consecutive_skips: None,
        }
    }

    /// Derive the slice count from a total duration and an interval
    pub fn from_duration(duration_secs: u64, interval_secs: u64) -> Result<Self> {
        if interval_secs == 0 {
            return Err(Error::InvalidStrategySpec("interval must be positive".into()));
        }
        if interval_secs >= duration_secs {
            return Err(Error::InvalidStrategySpec(
                "interval must be less than total duration".into(),
            ));
        }
        let slices = u32::try_from(duration_secs / interval_secs)
            .map_err(|_| Error::InvalidStrategySpec("too many slices".into()))?;
        Ok(Self::new(slices, interval_secs))
    }

    pub fn with_price_limit(mut self, price_limit: Option<Decimal>) -> Self {
        self.price_limit = price_limit;
        self
    }
}

/// Strategy-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StrategyKind {
    Grid(GridParams),
    Oco(OcoParams),
    Twap(TwapParams),
    Limit { price: Decimal },
    Market,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Grid(_) => "grid",
            StrategyKind::Oco(_) => "oco",
            StrategyKind::Twap(_) => "twap",
            StrategyKind::Limit { .. } => "limit",
            StrategyKind::Market => "market",
        }
    }
}

/// What a caller submits to the engine
///
/// For a grid `quantity` is the total fill volume the grid may trade; for
/// every other strategy it is the quantity to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    #[serde(flatten)]
    pub kind: StrategyKind,
}

impl fmt::Display for StrategySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.kind.name(),
            self.side,
            self.quantity,
            self.symbol
        )
    }
}

impl StrategySpec {
    pub fn new(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, kind: StrategyKind) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            kind,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self::new(symbol, side, quantity, StrategyKind::Limit { price })
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self::new(symbol, side, quantity, StrategyKind::Market)
    }

    /// Check the spec against trading limits before it enters the engine
    pub fn validate(&self, limits: &TradingLimits) -> Result<()> {
        validate_symbol(&self.symbol)?;

        match &self.kind {
            StrategyKind::Limit { price } => {
                limits.check_quantity("quantity", self.quantity)?;
                check_price("price", *price)
            }
            StrategyKind::Market => limits.check_quantity("quantity", self.quantity),
            StrategyKind::Oco(params) => {
                limits.check_quantity("quantity", self.quantity)?;
                check_price("limit price", params.limit_price)?;
                check_price("stop price", params.stop_price)?;
                if let Some(stop_limit) = params.stop_limit_price {
                    check_price("stop limit price", stop_limit)?;
                }
                let ordered = match self.side {
                    OrderSide::Sell => params.limit_price > params.stop_price,
                    OrderSide::Buy => params.limit_price < params.stop_price,
                };
                if !ordered {
                    return Err(Error::InvalidStrategySpec(format!(
                        "{} OCO needs the limit price on the profit side of the stop price",
                        self.side
                    )));
                }
                Ok(())
            }
            StrategyKind::Twap(params) => {
                if self.quantity <= Decimal::ZERO {
                    return Err(Error::InvalidStrategySpec("total quantity must be positive".into()));
                }
                if self.quantity > limits.max_quantity * Decimal::from(10) {
                    return Err(Error::InvalidStrategySpec("total quantity too large".into()));
                }
                if params.slices == 0 {
                    return Err(Error::InvalidStrategySpec("slice count must be positive".into()));
                }
                if params.interval_secs == 0 {
                    return Err(Error::InvalidStrategySpec("interval must be positive".into()));
                }
                let horizon = params.interval_secs.saturating_mul(u64::from(params.slices));
                if horizon > limits.max_twap_horizon_secs {
                    return Err(Error::InvalidStrategySpec(format!(
                        "TWAP horizon {}s exceeds {}s",
                        horizon, limits.max_twap_horizon_secs
                    )));
                }
                if let Some(limit) = params.price_limit {
                    check_price("price limit", limit)?;
                }
                let slice = limits.round_quantity(self.quantity / Decimal::from(params.slices));
                limits.check_quantity("slice quantity", slice)
            }
            StrategyKind::Grid(params) => {
                let count = params.ladder.level_count();
                if count < 2 || count > limits.max_grid_levels as usize {
                    return Err(Error::InvalidStrategySpec(format!(
                        "grid needs between 2 and {} levels, got {}",
                        limits.max_grid_levels, count
                    )));
                }
                match &params.ladder {
                    GridLadder::Levels { levels } => {
                        for price in levels {
                            check_price("grid level", *price)?;
                        }
                    }
                    GridLadder::Range {
                        lower_price,
                        upper_price,
                        ..
                    } => {
                        check_price("lower price", *lower_price)?;
                        if upper_price <= lower_price {
                            return Err(Error::InvalidStrategySpec(
                                "upper price must be greater than lower price".into(),
                            ));
                        }
                    }
                }
                if params.ladder.prices(limits).len() != count {
                    return Err(Error::InvalidStrategySpec(
                        "grid levels must be distinct at the configured price precision".into(),
                    ));
                }
                limits.check_quantity("quantity per level", params.quantity_per_level)?;
                if self.quantity < params.quantity_per_level {
                    return Err(Error::InvalidStrategySpec(
                        "grid volume budget is smaller than one level".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_price(what: &str, price: Decimal) -> Result<()> {
    if price <= Decimal::ZERO {
        return Err(Error::InvalidStrategySpec(format!("{} must be positive", what)));
    }
    Ok(())
}

fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.len() < 6 {
        return Err(Error::InvalidStrategySpec(
            "symbol must be at least 6 characters".into(),
        ));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(Error::InvalidStrategySpec(
            "symbol must contain only uppercase letters and numbers".into(),
        ));
    }
    Ok(())
}
