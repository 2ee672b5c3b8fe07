//! Orders, fills and the tracker that reconciles them with exchange updates
//!
//! Every order the engine emits is tracked here from the moment a strategy asks
//! for it (`New`), through exchange acknowledgement (`Open`), to a terminal
//! state (`Filled`, `Cancelled`, `Rejected`). The tracker is the only place
//! fills are recorded, which is what keeps duplicate notifications harmless.

mod tracker;
mod types;

pub use tracker::{AppliedUpdate, FillTotals, OrderTracker};
pub use types::{
    ClientOrderId, FillEvent, Order, OrderAck, OrderId, OrderKind, OrderRequest, OrderSide,
    OrderState, OrderUpdate, StrategyId,
};
