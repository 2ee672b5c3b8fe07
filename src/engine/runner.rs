//! Engine runner - main execution loop
//!
//! Owns the [`StrategyEngine`] and serializes everything that touches it:
//! caller commands, the gateway update stream and the tick timer all go
//! through one `tokio::select!` loop, so no update is ever applied mid-tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use super::engine::{OrderIntent, StrategyEngine};
use super::market_data::PriceBook;
use super::status::{EngineSnapshot, StrategySummary};
use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use crate::gateway::{ExchangeGateway, RetryPolicy};
use crate::order::StrategyId;
use crate::strategy::StrategySpec;

const COMMAND_BUFFER: usize = 64;

/// Requests from callers, each answered on its own oneshot channel
pub enum EngineCommand {
    Submit {
        spec: StrategySpec,
        reply: oneshot::Sender<Result<StrategyId>>,
    },
    Cancel {
        id: StrategyId,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        id: StrategyId,
        reply: oneshot::Sender<Option<StrategySummary>>,
    },
    Summaries {
        reply: oneshot::Sender<Vec<StrategySummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<EngineSnapshot>,
    },
}

/// Cloneable handle for talking to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn submit(&self, spec: StrategySpec) -> Result<StrategyId> {
        self.request(|reply| EngineCommand::Submit { spec, reply }).await?
    }

    pub async fn cancel(&self, id: StrategyId) -> Result<()> {
        self.request(|reply| EngineCommand::Cancel { id, reply }).await?
    }

    pub async fn status(&self, id: StrategyId) -> Result<Option<StrategySummary>> {
        self.request(|reply| EngineCommand::Status { id, reply }).await
    }

    pub async fn summaries(&self) -> Result<Vec<StrategySummary>> {
        self.request(|reply| EngineCommand::Summaries { reply }).await
    }

    /// Stop the runner; returns the final snapshot
    pub async fn shutdown(&self) -> Result<EngineSnapshot> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ChannelClosed("engine runner stopped".to_string()))?;
        response
            .await
            .map_err(|_| Error::ChannelClosed("engine runner dropped the request".to_string()))
    }
}

pub struct EngineRunner<G: ExchangeGateway> {
    engine: StrategyEngine,
    gateway: Arc<G>,
    commands: mpsc::Receiver<EngineCommand>,
    config: EngineConfig,
    retry: RetryPolicy,
    prices: PriceBook,
}

impl<G: ExchangeGateway + 'static> EngineRunner<G> {
    pub fn new(engine: StrategyEngine, gateway: Arc<G>, config: EngineConfig) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let runner = Self {
            engine,
            gateway,
            commands: rx,
            retry: config.retry_policy(),
            config,
            prices: PriceBook::new(),
        };
        (runner, EngineHandle { commands: tx })
    }

    /// Run until shut down, or until every handle is dropped
    pub async fn run(mut self) -> Result<EngineSnapshot> {
        info!(
            "Starting engine runner (tick {}ms, {} retries)",
            self.config.tick_interval_ms, self.retry.max_attempts
        );
        let mut updates = self.gateway.subscribe().await?;
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut save_timer = interval(Duration::from_secs(self.config.state_save_interval_secs.max(1)));
        let mut consecutive_errors = 0u32;
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All engine handles dropped");
                        break;
                    }
                },
                Some(update) = updates.recv() => {
                    // Duplicates and unknown ids are logged by the engine
                    let _ = self.engine.on_order_update(&update);
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(_) => consecutive_errors = 0,
                        Err(e) => {
                            error!("Gateway unavailable: {}", e);
                            consecutive_errors += 1;
                        }
                    }
                }
                _ = save_timer.tick(), if self.config.state_file.is_some() => {
                    self.save_snapshot();
                }
            }

            if consecutive_errors >= self.config.max_consecutive_errors.max(1) {
                error!("Too many consecutive gateway failures, shutting down");
                self.save_snapshot();
                return Err(Error::TransientGateway(format!(
                    "{} consecutive ticks with exhausted retries",
                    consecutive_errors
                )));
            }
        }

        let snapshot = self.engine.snapshot();
        self.save_snapshot();
        if !self.engine.is_idle() {
            warn!("Stopping with strategies or orders still working");
        }
        info!(
            "Engine runner stopped ({} strategies, {} live orders)",
            snapshot.strategies.len(),
            snapshot.live_orders
        );
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(snapshot.clone());
        }
        Ok(snapshot)
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit { spec, reply } => {
                let _ = reply.send(self.engine.submit(spec));
            }
            EngineCommand::Cancel { id, reply } => {
                let _ = reply.send(self.engine.cancel(id));
            }
            EngineCommand::Status { id, reply } => {
                let _ = reply.send(self.engine.strategy(id));
            }
            EngineCommand::Summaries { reply } => {
                let _ = reply.send(self.engine.summaries());
            }
            EngineCommand::Shutdown { reply } => {
                let _ = reply.send(self.engine.snapshot());
            }
        }
    }

    /// Refresh prices, advance the engine and execute its intents
    async fn tick(&mut self) -> Result<()> {
        for symbol in self.engine.active_symbols() {
            match self.gateway.last_price(&symbol).await {
                Ok(price) => self.prices.set(symbol, price),
                Err(e) => {
                    debug!("No price for {}: {}", symbol, e);
                    self.prices.clear(&symbol);
                }
            }
        }

        let intents = self.engine.tick(Utc::now(), &self.prices);
        self.dispatch(intents).await
    }

    /// Send intents to the gateway in order and feed the outcomes back
    ///
    /// Returns the last `RetriesExhausted` error, if any.
    async fn dispatch(&mut self, intents: Vec<OrderIntent>) -> Result<()> {
        let mut exhausted = None;

        for intent in intents {
            match intent {
                OrderIntent::Place(request) => {
                    // An earlier intent in this batch may have failed the strategy
                    if !self.engine.confirm_placement(request.client_order_id) {
                        continue;
                    }
                    let gateway = Arc::clone(&self.gateway);
                    let what = format!("place {}", request.client_order_id);
                    let result = self
                        .retry
                        .run(&what, || {
                            let gateway = Arc::clone(&gateway);
                            let request = request.clone();
                            async move { gateway.place_order(&request).await }
                        })
                        .await;

                    let outcome = match result {
                        Ok(ack) => self.engine.on_order_placed(request.client_order_id, ack.order_id),
                        Err(e) => {
                            let reason = rejection_reason(&e);
                            if matches!(e, Error::RetriesExhausted { .. }) {
                                exhausted = Some(e);
                            }
                            self.engine.on_order_rejected(request.client_order_id, &reason)
                        }
                    };
                    if let Err(e) = outcome {
                        warn!("Placement result for {} not applied: {}", request.client_order_id, e);
                    }
                }
                OrderIntent::Cancel {
                    client_order_id,
                    symbol,
                    order_id,
                } => {
                    let gateway = Arc::clone(&self.gateway);
                    let what = format!("cancel {}", client_order_id);
                    let result = self
                        .retry
                        .run(&what, || {
                            let gateway = Arc::clone(&gateway);
                            let symbol = symbol.clone();
                            async move { gateway.cancel_order(&symbol, order_id).await }
                        })
                        .await;

                    match result {
                        Ok(()) => {
                            if let Err(e) = self.engine.on_cancel_acknowledged(client_order_id) {
                                warn!("Cancel result for {} not applied: {}", client_order_id, e);
                            }
                        }
                        Err(e) => {
                            self.engine.on_cancel_failed(client_order_id, &e);
                            if matches!(e, Error::RetriesExhausted { .. }) {
                                exhausted = Some(e);
                            }
                        }
                    }
                }
            }
        }

        match exhausted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn save_snapshot(&self) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        match self.engine.snapshot().save_to_file_atomic(path) {
            Ok(()) => debug!("Snapshot saved to {}", path.display()),
            Err(e) => warn!("Failed to save snapshot: {}", e),
        }
    }
}

fn rejection_reason(error: &Error) -> String {
    match error {
        Error::RejectedOrder { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}
