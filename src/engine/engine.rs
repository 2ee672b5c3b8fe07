//! Strategy engine - owns every strategy and its orders
//!
//! The engine is a synchronous state machine. It never performs I/O: ticks
//! and order events go in, [`OrderIntent`]s come out, and the runner turns
//! those into gateway calls and feeds the results back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;

use super::market_data::MarketData;
use super::status::{EngineSnapshot, StrategyStatus, StrategySummary};
use crate::config::{EngineConfig, TradingLimits};
use crate::errors::{Error, Result};
use crate::order::{
    AppliedUpdate, ClientOrderId, OrderId, OrderRequest, OrderState, OrderTracker, OrderUpdate,
    StrategyId,
};
use crate::strategy::{self, Strategy, StrategyAction, StrategySpec};

/// What the engine wants done on the exchange
#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntent {
    Place(OrderRequest),
    Cancel {
        client_order_id: ClientOrderId,
        symbol: String,
        order_id: OrderId,
    },
}

impl OrderIntent {
    pub fn client_order_id(&self) -> ClientOrderId {
        match self {
            OrderIntent::Place(request) => request.client_order_id,
            OrderIntent::Cancel {
                client_order_id, ..
            } => *client_order_id,
        }
    }
}

struct StrategyEntry {
    spec: StrategySpec,
    strategy: Box<dyn Strategy>,
    status: StrategyStatus,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct StrategyEngine {
    limits: TradingLimits,
    config: EngineConfig,
    strategies: BTreeMap<StrategyId, StrategyEntry>,
    tracker: OrderTracker,
    /// Intents produced between ticks, released on the next tick
    outbox: Vec<OrderIntent>,
    next_strategy_id: u64,
}

impl StrategyEngine {
    pub fn new(limits: TradingLimits, config: EngineConfig) -> Self {
        Self {
            limits,
            config,
            strategies: BTreeMap::new(),
            tracker: OrderTracker::new(),
            outbox: Vec::new(),
            next_strategy_id: 1,
        }
    }

    /// Validate a spec and add the strategy in `Pending` state
    pub fn submit(&mut self, spec: StrategySpec) -> Result<StrategyId> {
        spec.validate(&self.limits)?;

        let id = StrategyId(self.next_strategy_id);
        self.next_strategy_id += 1;

        let strategy = strategy::build(id, &spec, &self.limits, &self.config);
        info!("Strategy {} submitted: {}", id, spec);

        let now = Utc::now();
        self.strategies.insert(
            id,
            StrategyEntry {
                spec,
                strategy,
                status: StrategyStatus::Pending,
                failure: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    /// Advance every running strategy and collect the intents to execute
    ///
    /// Reactions to order events since the previous tick come first, in the
    /// order they were produced.
    pub fn tick(&mut self, now: DateTime<Utc>, market: &dyn MarketData) -> Vec<OrderIntent> {
        if let Some(retention) = self.config.archive_retention() {
            self.tracker.prune_archived(now - retention);
        }

        let running: Vec<StrategyId> = self
            .strategies
            .iter()
            .filter(|(_, entry)| entry.status.is_running())
            .map(|(id, _)| *id)
            .collect();

        for id in running {
            let action = match self.strategies.get_mut(&id) {
                Some(entry) => entry.strategy.on_tick(now, market),
                None => continue,
            };
            self.apply_action(id, action);
            self.refresh_status(id);
        }

        // Cancels that were refused or ran out of retries go out again
        let winding_down: Vec<StrategyId> = self
            .strategies
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.status, StrategyStatus::Cancelling | StrategyStatus::Failed)
            })
            .map(|(id, _)| *id)
            .filter(|id| self.tracker.has_working_orders(*id))
            .collect();
        for id in winding_down {
            self.cancel_working_orders(id);
        }

        std::mem::take(&mut self.outbox)
    }

    /// Check that a released placement is still wanted just before it is sent
    ///
    /// An order whose strategy stopped running, or that was cancelled, after
    /// the tick released it is resolved as `Cancelled` locally and `false` is
    /// returned; the caller must not send it.
    pub fn confirm_placement(&mut self, client_order_id: ClientOrderId) -> bool {
        let wanted = self.tracker.get(&client_order_id).map_or(false, |order| {
            !order.cancel_requested
                && !order.state.is_terminal()
                && self
                    .strategies
                    .get(&order.strategy_id())
                    .map_or(false, |entry| entry.status.is_running())
        });
        if wanted {
            return true;
        }

        if let Ok(applied) = self.tracker.resolve(client_order_id, OrderState::Cancelled) {
            info!("Order {} withdrawn before placement", client_order_id);
            self.handle_applied(applied);
        }
        false
    }

    /// Apply an order update from the exchange stream
    ///
    /// Duplicates are logged and returned as [`Error::DuplicateUpdate`]
    /// without touching any state.
    pub fn on_order_update(&mut self, update: &OrderUpdate) -> Result<()> {
        let applied = match self.tracker.apply_update(update) {
            Ok(applied) => applied,
            Err(e) if e.is_duplicate() => {
                debug!("Ignoring duplicate: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!("Ignoring update for order {}: {}", update.order_id, e);
                return Err(e);
            }
        };

        self.handle_applied(applied);
        Ok(())
    }

    /// Bind the exchange id returned by a successful placement
    pub fn on_order_placed(
        &mut self,
        client_order_id: ClientOrderId,
        order_id: OrderId,
    ) -> Result<()> {
        let strategy_id = self.tracker.register(client_order_id, order_id)?;
        debug!("Order {} acknowledged as {}", client_order_id, order_id);

        // A cancel requested before the ack can go out now
        if let Some(order) = self.tracker.get(&client_order_id) {
            if order.cancel_requested && !order.state.is_terminal() {
                self.outbox.push(OrderIntent::Cancel {
                    client_order_id,
                    symbol: order.request.symbol.clone(),
                    order_id,
                });
            }
        }

        if let Some(entry) = self.strategies.get_mut(&strategy_id) {
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    /// A placement was refused (or retries ran out): the owning strategy fails
    pub fn on_order_rejected(
        &mut self,
        client_order_id: ClientOrderId,
        reason: &str,
    ) -> Result<()> {
        let applied = self.tracker.resolve(client_order_id, OrderState::Rejected)?;
        warn!("Order {} rejected: {}", client_order_id, reason);

        self.fail(
            applied.strategy_id,
            format!("order {} rejected: {}", client_order_id, reason),
        );
        self.tracker.archive(client_order_id);
        self.refresh_status(applied.strategy_id);
        Ok(())
    }

    /// The exchange accepted a cancel request; the final state follows on the stream
    pub fn on_cancel_acknowledged(&mut self, client_order_id: ClientOrderId) -> Result<()> {
        let order = self
            .tracker
            .get(&client_order_id)
            .ok_or_else(|| Error::OrderNotFound(client_order_id.to_string()))?;
        debug!("Cancel of {} accepted ({})", client_order_id, order.state);
        Ok(())
    }

    /// The exchange refused a cancel; the order keeps its current state
    pub fn on_cancel_failed(&mut self, client_order_id: ClientOrderId, error: &Error) {
        warn!("Cancel of {} failed: {}", client_order_id, error);
        self.tracker.cancel_refused(client_order_id);
    }

    /// Cooperatively cancel a strategy
    ///
    /// The strategy moves to `Cancelling` and cancel intents go out for its
    /// working orders; it becomes `Cancelled` once none remain.
    pub fn cancel(&mut self, id: StrategyId) -> Result<()> {
        let entry = self.strategies.get(&id).ok_or(Error::StrategyNotFound(id))?;
        if entry.status.is_terminal() {
            return Err(Error::InvalidState {
                id,
                current_state: entry.status.to_string(),
            });
        }

        self.transition(id, StrategyStatus::Cancelling);
        self.cancel_working_orders(id);
        self.refresh_status(id);
        Ok(())
    }

    pub fn strategy(&self, id: StrategyId) -> Option<StrategySummary> {
        self.strategies.get(&id).map(|entry| self.summarize(id, entry))
    }

    pub fn summaries(&self) -> Vec<StrategySummary> {
        self.strategies
            .iter()
            .map(|(id, entry)| self.summarize(*id, entry))
            .collect()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: Utc::now(),
            strategies: self.summaries(),
            live_orders: self.tracker.live_count(),
            archived_orders: self.tracker.archived_count(),
        }
    }

    /// Symbols of strategies whose logic still runs
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .strategies
            .values()
            .filter(|entry| entry.status.is_running())
            .map(|entry| entry.spec.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// No strategy is running and no order is working
    pub fn is_idle(&self) -> bool {
        self.outbox.is_empty()
            && self.strategies.iter().all(|(id, entry)| {
                entry.status.is_terminal() && !self.tracker.has_working_orders(*id)
            })
    }

    pub fn tracker(&self) -> &OrderTracker {
        &self.tracker
    }

    fn handle_applied(&mut self, applied: AppliedUpdate) {
        let strategy_id = applied.strategy_id;
        let Some(status) = self.strategies.get(&strategy_id).map(|e| e.status) else {
            warn!("Update for {} of unknown strategy {}", applied.client_order_id, strategy_id);
            return;
        };

        if let Some(fill) = &applied.discarded_fill {
            info!(
                "OCO leg {} lost to its sibling; fill {} ({} @ {}) not applied",
                applied.client_order_id, fill.fill_id, fill.quantity, fill.price
            );
        }
        if let Some(fill) = &applied.fill {
            info!(
                "Strategy {} order {} filled {} @ {} ({})",
                strategy_id, applied.client_order_id, fill.quantity, fill.price, applied.state
            );
        }

        if applied.state == OrderState::Rejected && applied.became_terminal() {
            self.fail(
                strategy_id,
                format!("order {} rejected by exchange", applied.client_order_id),
            );
        } else if status.is_running() && (applied.fill.is_some() || applied.became_terminal()) {
            let action = match (
                self.tracker.get(&applied.client_order_id),
                self.strategies.get_mut(&strategy_id),
            ) {
                (Some(order), Some(entry)) => {
                    entry.strategy.on_order_event(order, applied.fill.as_ref())
                }
                _ => StrategyAction::none(),
            };
            self.apply_action(strategy_id, action);
        }

        if applied.became_terminal() {
            self.tracker.archive(applied.client_order_id);
        }
        if let Some(entry) = self.strategies.get_mut(&strategy_id) {
            entry.updated_at = Utc::now();
        }
        self.refresh_status(strategy_id);
    }

    fn apply_action(&mut self, id: StrategyId, action: StrategyAction) {
        if action.is_empty() {
            return;
        }

        let status = self.strategies.get(&id).map(|entry| entry.status);

        if status.map_or(false, |s| s.is_running()) {
            for request in &action.orders {
                if request.strategy_id() != id {
                    error!("Strategy {} emitted order {} it does not own", id, request.client_order_id);
                    continue;
                }
                let sibling = action.sibling_of(request.client_order_id);
                self.tracker.track(request.clone(), sibling);
                self.outbox.push(OrderIntent::Place(request.clone()));
            }
            if action.has_orders() && status == Some(StrategyStatus::Pending) {
                self.transition(id, StrategyStatus::Active);
            }
        }

        for client_order_id in &action.cancels {
            self.request_cancel(*client_order_id);
        }

        if let Some(reason) = action.failure {
            self.fail(id, reason);
        }
    }

    fn request_cancel(&mut self, client_order_id: ClientOrderId) {
        match self.tracker.request_cancel(client_order_id) {
            Ok(Some(order_id)) => {
                if let Some(order) = self.tracker.get(&client_order_id) {
                    self.outbox.push(OrderIntent::Cancel {
                        client_order_id,
                        symbol: order.request.symbol.clone(),
                        order_id,
                    });
                }
            }
            Ok(None) => {
                // Still queued for placement: drop it instead of placing then cancelling
                let queued = self.outbox.iter().position(|intent| {
                    matches!(intent, OrderIntent::Place(r) if r.client_order_id == client_order_id)
                });
                if let Some(pos) = queued {
                    self.outbox.remove(pos);
                    if let Ok(applied) = self.tracker.resolve(client_order_id, OrderState::Cancelled) {
                        debug!("Order {} withdrawn before placement", client_order_id);
                        self.handle_applied(applied);
                    }
                }
            }
            Err(e) => warn!("Cannot cancel {}: {}", client_order_id, e),
        }
    }

    fn cancel_working_orders(&mut self, id: StrategyId) {
        let working: Vec<ClientOrderId> = self
            .tracker
            .working_orders(id)
            .map(|order| order.client_order_id)
            .collect();
        for client_order_id in working {
            self.request_cancel(client_order_id);
        }
    }

    fn fail(&mut self, id: StrategyId, reason: String) {
        let Some(entry) = self.strategies.get_mut(&id) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }

        error!("Strategy {} failed: {}", id, reason);
        entry.failure = Some(reason);
        self.transition(id, StrategyStatus::Failed);
        self.cancel_working_orders(id);
    }

    fn transition(&mut self, id: StrategyId, next: StrategyStatus) {
        if let Some(entry) = self.strategies.get_mut(&id) {
            if entry.status != next {
                info!(
                    "Strategy {} ({}) {} -> {}",
                    id,
                    entry.strategy.name(),
                    entry.status,
                    next
                );
                entry.status = next;
                entry.updated_at = Utc::now();
            }
        }
    }

    /// Derive status from order progress
    fn refresh_status(&mut self, id: StrategyId) {
        let Some(entry) = self.strategies.get(&id) else {
            return;
        };
        let working = self.tracker.has_working_orders(id);

        let next = match entry.status {
            StrategyStatus::Cancelling if !working => Some(StrategyStatus::Cancelled),
            StrategyStatus::Active | StrategyStatus::PartiallyFilled | StrategyStatus::Pending => {
                if !working && entry.strategy.is_complete() {
                    Some(StrategyStatus::Completed)
                } else if entry.status == StrategyStatus::Active
                    && self.filled(id).0 > Decimal::ZERO
                {
                    Some(StrategyStatus::PartiallyFilled)
                } else {
                    None
                }
            }
            _ => None,
        };

        if let Some(next) = next {
            self.transition(id, next);
        }
    }

    /// Filled quantity and average price across all orders of a strategy
    fn filled(&self, id: StrategyId) -> (Decimal, Option<Decimal>) {
        let totals = self.tracker.fill_totals(id);
        (totals.quantity, totals.average_price())
    }

    fn summarize(&self, id: StrategyId, entry: &StrategyEntry) -> StrategySummary {
        let (filled_quantity, avg_fill_price) = self.filled(id);
        StrategySummary {
            id,
            kind: entry.strategy.name().to_string(),
            symbol: entry.spec.symbol.clone(),
            side: entry.spec.side,
            status: entry.status,
            target_quantity: entry.strategy.target_quantity(),
            filled_quantity,
            avg_fill_price,
            working_orders: self.tracker.working_orders(id).count(),
            failure: entry.failure.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            details: entry.strategy.details(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PriceBook;
    use crate::order::{FillEvent, OrderSide};
    use crate::strategy::{GridDirection, GridLadder, GridParams, OcoParams, StrategyKind, TwapParams};
    use rust_decimal_macros::dec;

    fn engine() -> StrategyEngine {
        StrategyEngine::new(TradingLimits::default(), EngineConfig::default())
    }

    fn market(price: Decimal) -> PriceBook {
        let mut book = PriceBook::new();
        book.set("BTCUSDT", price);
        book
    }

    fn placement(intent: &OrderIntent) -> Option<&OrderRequest> {
        match intent {
            OrderIntent::Place(request) => Some(request),
            OrderIntent::Cancel { .. } => None,
        }
    }

    /// Acknowledge every placement with sequential exchange ids
    fn ack_all(engine: &mut StrategyEngine, intents: &[OrderIntent], next_oid: &mut u64) -> Vec<OrderId> {
        let mut ids = Vec::new();
        for intent in intents {
            if let OrderIntent::Place(request) = intent {
                let oid = OrderId(*next_oid);
                *next_oid += 1;
                engine.on_order_placed(request.client_order_id, oid).unwrap();
                ids.push(oid);
            }
        }
        ids
    }

    #[test]
    fn test_invalid_spec_never_enters_engine() {
        let mut engine = engine();
        let err = engine
            .submit(StrategySpec::market("BTCUSDT", OrderSide::Buy, dec!(0)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStrategySpec(_)));
        assert!(engine.summaries().is_empty());
    }

    #[test]
    fn test_limit_lifecycle() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(2), dec!(100)))
            .unwrap();
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::Pending);

        let intents = engine.tick(Utc::now(), &PriceBook::new());
        assert_eq!(intents.len(), 1);
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::Active);
        assert!(engine.confirm_placement(intents[0].client_order_id()));

        let mut next_oid = 100;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);

        engine
            .on_order_update(&OrderUpdate::fill(
                oids[0],
                1,
                OrderState::Open,
                FillEvent::new("t1", dec!(1), dec!(100)),
            ))
            .unwrap();
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::PartiallyFilled);

        engine
            .on_order_update(&OrderUpdate::fill(
                oids[0],
                2,
                OrderState::Filled,
                FillEvent::new("t2", dec!(1), dec!(102)),
            ))
            .unwrap();
        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Completed);
        assert_eq!(summary.filled_quantity, dec!(2));
        assert_eq!(summary.avg_fill_price, Some(dec!(101)));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_grid_fill_reissues_on_next_tick() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::new(
                "BTCUSDT",
                OrderSide::Buy,
                dec!(10),
                StrategyKind::Grid(GridParams {
                    ladder: GridLadder::Levels {
                        levels: vec![dec!(100), dec!(102), dec!(104)],
                    },
                    quantity_per_level: dec!(1),
                    direction: GridDirection::Both,
                }),
            ))
            .unwrap();

        let intents = engine.tick(Utc::now(), &market(dec!(102)));
        assert_eq!(intents.len(), 2);
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);
        let buy_oid = oids[intents
            .iter()
            .position(|i| placement(i).map(|r| r.side) == Some(OrderSide::Buy))
            .unwrap()];

        engine
            .on_order_update(&OrderUpdate::fill(
                buy_oid,
                1,
                OrderState::Filled,
                FillEvent::new("t1", dec!(1), dec!(100)),
            ))
            .unwrap();

        let intents = engine.tick(Utc::now(), &market(dec!(100)));
        assert_eq!(intents.len(), 1);
        let sell = placement(&intents[0]).unwrap();
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.price(), Some(dec!(102)));
        assert_eq!(sell.quantity, dec!(1));
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::PartiallyFilled);
    }

    #[test]
    fn test_duplicate_fill_applied_once() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Sell, dec!(3), dec!(100)))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);

        let update = OrderUpdate::fill(
            oids[0],
            1,
            OrderState::Open,
            FillEvent::new("dup", dec!(1), dec!(100)),
        );
        engine.on_order_update(&update).unwrap();
        let once = engine.strategy(id).unwrap();

        assert!(engine.on_order_update(&update).unwrap_err().is_duplicate());
        let twice = engine.strategy(id).unwrap();
        assert_eq!(twice.filled_quantity, once.filled_quantity);
        assert_eq!(twice.status, once.status);
    }

    #[test]
    fn test_unknown_exchange_id_is_error() {
        let mut engine = engine();
        let err = engine
            .on_order_update(&OrderUpdate::state(OrderId(999), 1, OrderState::Open))
            .unwrap_err();
        assert!(matches!(err, Error::OrderNotFound(_)));
    }

    #[test]
    fn test_oco_fill_cancels_sibling_and_discards_late_fill() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::new(
                "BTCUSDT",
                OrderSide::Sell,
                dec!(1),
                StrategyKind::Oco(OcoParams {
                    limit_price: dec!(110),
                    stop_price: dec!(90),
                    stop_limit_price: None,
                }),
            ))
            .unwrap();

        let intents = engine.tick(Utc::now(), &market(dec!(100)));
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);
        let (take_profit, stop) = (oids[0], oids[1]);

        engine
            .on_order_update(&OrderUpdate::fill(
                take_profit,
                1,
                OrderState::Filled,
                FillEvent::new("tp", dec!(1), dec!(110)),
            ))
            .unwrap();

        let intents = engine.tick(Utc::now(), &market(dec!(110)));
        assert_eq!(intents.len(), 1);
        assert!(matches!(intents[0], OrderIntent::Cancel { order_id, .. } if order_id == stop));
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::PartiallyFilled);

        // Stop leg fills on the exchange before the cancel lands
        engine
            .on_order_update(&OrderUpdate::fill(
                stop,
                2,
                OrderState::Filled,
                FillEvent::new("sl", dec!(1), dec!(90)),
            ))
            .unwrap();

        let stop_order = engine.tracker().get(&intents[0].client_order_id()).unwrap();
        assert_eq!(stop_order.state, OrderState::Cancelled);
        assert_eq!(stop_order.filled_quantity, Decimal::ZERO);

        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Completed);
        assert_eq!(summary.filled_quantity, dec!(1));
    }

    #[test]
    fn test_twap_slices_one_per_tick() {
        let mut engine = engine();
        engine
            .submit(StrategySpec::new(
                "BTCUSDT",
                OrderSide::Buy,
                dec!(10),
                StrategyKind::Twap(TwapParams::new(5, 60)),
            ))
            .unwrap();

        let start = Utc::now();
        let market = market(dec!(100));
        let mut quantities = Vec::new();
        for i in 0..6 {
            let intents = engine.tick(start + chrono::Duration::seconds(60 * i), &market);
            assert!(intents.len() <= 1);
            quantities.extend(intents.iter().filter_map(placement).map(|r| r.quantity));
        }
        assert_eq!(quantities, vec![dec!(2); 5]);
    }

    #[test]
    fn test_rejection_fails_only_owner() {
        let mut engine = engine();
        let first = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100)))
            .unwrap();
        let second = engine
            .submit(StrategySpec::limit("ETHUSDT", OrderSide::Buy, dec!(1), dec!(2000)))
            .unwrap();

        let intents = engine.tick(Utc::now(), &PriceBook::new());
        assert_eq!(intents.len(), 2);
        engine
            .on_order_rejected(intents[0].client_order_id(), "insufficient balance")
            .unwrap();
        engine
            .on_order_placed(intents[1].client_order_id(), OrderId(2))
            .unwrap();

        let failed = engine.strategy(first).unwrap();
        assert_eq!(failed.status, StrategyStatus::Failed);
        assert!(failed.failure.unwrap().contains("insufficient balance"));
        assert_eq!(engine.strategy(second).unwrap().status, StrategyStatus::Active);

        assert!(engine.tick(Utc::now(), &PriceBook::new()).is_empty());
    }

    #[test]
    fn test_cancel_waits_for_working_orders() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100)))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);

        engine.cancel(id).unwrap();
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::Cancelling);
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        assert!(matches!(intents[0], OrderIntent::Cancel { .. }));
        engine.on_cancel_acknowledged(intents[0].client_order_id()).unwrap();

        engine
            .on_order_update(&OrderUpdate::state(oids[0], 1, OrderState::Cancelled))
            .unwrap();
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::Cancelled);
        assert!(matches!(engine.cancel(id), Err(Error::InvalidState { .. })));
        assert!(matches!(
            engine.cancel(StrategyId(42)),
            Err(Error::StrategyNotFound(StrategyId(42)))
        ));
    }

    #[test]
    fn test_cancel_before_ack_is_sent_on_ack() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100)))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());

        engine.cancel(id).unwrap();
        assert!(engine.tick(Utc::now(), &PriceBook::new()).is_empty());

        engine
            .on_order_placed(intents[0].client_order_id(), OrderId(5))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        assert!(matches!(intents[0], OrderIntent::Cancel { order_id: OrderId(5), .. }));
    }

    fn oco(engine: &mut StrategyEngine) -> StrategyId {
        engine
            .submit(StrategySpec::new(
                "BTCUSDT",
                OrderSide::Sell,
                dec!(1),
                StrategyKind::Oco(OcoParams {
                    limit_price: dec!(110),
                    stop_price: dec!(90),
                    stop_limit_price: None,
                }),
            ))
            .unwrap()
    }

    #[test]
    fn test_rejected_leg_withdraws_unsent_sibling() {
        let mut engine = engine();
        let id = oco(&mut engine);
        let intents = engine.tick(Utc::now(), &market(dec!(100)));
        assert_eq!(intents.len(), 2);

        engine
            .on_order_rejected(intents[0].client_order_id(), "insufficient balance")
            .unwrap();
        assert!(!engine.confirm_placement(intents[1].client_order_id()));

        let stop = engine.tracker().get(&intents[1].client_order_id()).unwrap();
        assert_eq!(stop.state, OrderState::Cancelled);
        assert_eq!(stop.order_id, None);

        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Failed);
        assert_eq!(summary.working_orders, 0);
        assert!(engine.is_idle());
        assert!(engine.tick(Utc::now(), &market(dec!(100))).is_empty());
    }

    #[test]
    fn test_filled_report_before_fill_completes_limit() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100)))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);

        engine
            .on_order_update(&OrderUpdate::state(oids[0], 1, OrderState::Filled))
            .unwrap();
        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Active);
        assert_eq!(summary.working_orders, 1);
        assert!(!engine.is_idle());

        engine
            .on_order_update(&OrderUpdate::fill(
                oids[0],
                2,
                OrderState::Filled,
                FillEvent::new("t1", dec!(1), dec!(100)),
            ))
            .unwrap();
        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Completed);
        assert_eq!(summary.filled_quantity, dec!(1));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_refused_cancel_keeps_losing_oco_leg_flagged() {
        let mut engine = engine();
        let id = oco(&mut engine);
        let intents = engine.tick(Utc::now(), &market(dec!(100)));
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);
        let stop_cid = intents[1].client_order_id();

        engine
            .on_order_update(&OrderUpdate::fill(
                oids[0],
                1,
                OrderState::Filled,
                FillEvent::new("tp", dec!(1), dec!(110)),
            ))
            .unwrap();
        let cancels = engine.tick(Utc::now(), &market(dec!(110)));
        assert!(matches!(
            cancels.as_slice(),
            [OrderIntent::Cancel { order_id, .. }] if *order_id == oids[1]
        ));

        engine.on_cancel_failed(stop_cid, &Error::OrderNotFound("exchange order 2".into()));
        assert!(engine.tracker().get(&stop_cid).unwrap().cancel_requested);
        assert!(engine.tick(Utc::now(), &market(dec!(90))).is_empty());

        engine
            .on_order_update(&OrderUpdate::fill(
                oids[1],
                2,
                OrderState::Filled,
                FillEvent::new("sl", dec!(1), dec!(90)),
            ))
            .unwrap();
        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Completed);
        assert_eq!(summary.filled_quantity, dec!(1));
        assert_eq!(engine.tracker().get(&stop_cid).unwrap().discarded_fills.len(), 1);
    }

    #[test]
    fn test_refused_cancel_retried_while_cancelling() {
        let mut engine = engine();
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100)))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);

        engine.cancel(id).unwrap();
        let cancels = engine.tick(Utc::now(), &PriceBook::new());
        assert_eq!(cancels.len(), 1);
        engine.on_cancel_failed(
            cancels[0].client_order_id(),
            &Error::RetriesExhausted {
                attempts: 5,
                reason: "timeout".into(),
            },
        );

        let summary = engine.strategy(id).unwrap();
        assert_eq!(summary.status, StrategyStatus::Cancelling);
        assert_eq!(summary.working_orders, 1);

        // Cancelling again is allowed and does not double up with the tick retry
        engine.cancel(id).unwrap();
        let cancels = engine.tick(Utc::now(), &PriceBook::new());
        assert!(matches!(
            cancels.as_slice(),
            [OrderIntent::Cancel { order_id, .. }] if *order_id == oids[0]
        ));

        engine
            .on_order_update(&OrderUpdate::state(oids[0], 1, OrderState::Cancelled))
            .unwrap();
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::Cancelled);
    }

    #[test]
    fn test_failed_strategy_retries_exhausted_cancels() {
        let mut engine = engine();
        let id = oco(&mut engine);
        let intents = engine.tick(Utc::now(), &market(dec!(100)));
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);
        let take_profit = intents[0].client_order_id();

        engine
            .on_order_update(&OrderUpdate::state(oids[1], 1, OrderState::Rejected))
            .unwrap();
        assert_eq!(engine.strategy(id).unwrap().status, StrategyStatus::Failed);
        let cancels = engine.tick(Utc::now(), &market(dec!(100)));
        assert!(matches!(
            cancels.as_slice(),
            [OrderIntent::Cancel { order_id, .. }] if *order_id == oids[0]
        ));

        engine.on_cancel_failed(
            take_profit,
            &Error::RetriesExhausted {
                attempts: 5,
                reason: "timeout".into(),
            },
        );
        assert!(matches!(engine.cancel(id), Err(Error::InvalidState { .. })));

        let cancels = engine.tick(Utc::now(), &market(dec!(100)));
        assert!(matches!(
            cancels.as_slice(),
            [OrderIntent::Cancel { order_id, .. }] if *order_id == oids[0]
        ));
        assert!(!engine.is_idle());

        engine
            .on_order_update(&OrderUpdate::state(oids[0], 2, OrderState::Cancelled))
            .unwrap();
        assert!(engine.is_idle());
        assert!(engine.tick(Utc::now(), &market(dec!(100))).is_empty());
    }

    #[test]
    fn test_pruned_orders_still_count_toward_fills() {
        let config = EngineConfig {
            archive_retention_secs: 60,
            ..EngineConfig::default()
        };
        let mut engine = StrategyEngine::new(TradingLimits::default(), config);
        let id = engine
            .submit(StrategySpec::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(100)))
            .unwrap();
        let intents = engine.tick(Utc::now(), &PriceBook::new());
        let mut next_oid = 1;
        let oids = ack_all(&mut engine, &intents, &mut next_oid);
        engine
            .on_order_update(&OrderUpdate::fill(
                oids[0],
                1,
                OrderState::Filled,
                FillEvent::new("t1", dec!(1), dec!(100)),
            ))
            .unwrap();
        assert_eq!(engine.snapshot().archived_orders, 1);

        engine.tick(Utc::now() + chrono::Duration::seconds(120), &PriceBook::new());
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.archived_orders, 0);
        assert_eq!(snapshot.strategies[0].filled_quantity, dec!(1));
        assert_eq!(snapshot.strategies[0].avg_fill_price, Some(dec!(100)));
        assert_eq!(snapshot.strategies[0].status, StrategyStatus::Completed);
    }

    #[test]
    fn test_snapshot_lists_strategies() {
        let mut engine = engine();
        engine
            .submit(StrategySpec::market("BTCUSDT", OrderSide::Buy, dec!(1)))
            .unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.strategies.len(), 1);
        assert_eq!(snapshot.strategies[0].kind, "market");
        assert_eq!(engine.active_symbols(), vec!["BTCUSDT".to_string()]);
    }
}
