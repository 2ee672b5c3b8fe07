use std::collections::HashMap;

use rust_decimal::Decimal;

/// Read-only view of market prices handed to strategies on each tick
pub trait MarketData {
    /// Last known price, or `None` when no data is available
    fn last_price(&self, symbol: &str) -> Option<Decimal>;
}

/// Latest price per symbol
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    prices: HashMap<String, Decimal>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, symbol: impl Into<String>, price: Decimal) {
        self.prices.insert(symbol.into(), price);
    }

    /// Forget a symbol, e.g. after its feed failed
    pub fn clear(&mut self, symbol: &str) {
        self.prices.remove(symbol);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl MarketData for PriceBook {
    fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }
}
