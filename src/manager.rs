//! Position lifecycle manager: turns signals into at most one open position
//! per key, and keeps the store and ledger in step with venue fills.
//!
//! Signals for the same key are serialized by a per-key async mutex held
//! across the whole BUY or SELL, venue round-trips included. Unrelated keys
//! proceed independently.
//!
//! A store write that still fails after a venue fill stays owed on its key.
//! The key settles it before its next venue call, so a fill is never traded
//! twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::Mutex as KeyLock;
use tracing::{debug, error, info, warn};

use crate::chain_cache::ChainCache;
use crate::config::AppConfig;
use crate::error::{TradeError, TradeResult};
use crate::lifecycle::{transition, LifecycleEvent, LifecycleState};
use crate::parser::parse_signal;
use crate::risk::RiskEngine;
use crate::selector::{choose_by_delta, select_contracts, DeltaBand, ExpirationPolicy};
use crate::store::Store;
use crate::supervisor::{Backoff, Supervisor};
use crate::types::{
    Action, LedgerClose, LedgerOpen, OrderRequest, Outcome, Position, PositionKey, QuoteSnapshot,
    QuotedContract, Side, Signal,
};
use crate::venue::Venue;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub balance: f64,
    pub strike_count: usize,
    pub band: DeltaBand,
    pub skip_zero_day: bool,
    pub key_includes_right: bool,
    pub dry_run: bool,
    pub buy_slippage: f64,
    pub sell_slippage: f64,
    pub venue_timeout: Duration,
    /// Retry schedule for store writes that follow a venue fill.
    pub write_backoff: Backoff,
}

impl ManagerSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            balance: cfg.risk.balance,
            strike_count: cfg.selection.strike_count,
            band: DeltaBand::from(&cfg.selection),
            skip_zero_day: cfg.selection.skip_zero_day,
            key_includes_right: cfg.positions.key_includes_right,
            dry_run: cfg.exec.dry_run,
            buy_slippage: cfg.exec.buy_limit_slippage_pct,
            sell_slippage: cfg.exec.sell_limit_slippage_pct,
            venue_timeout: cfg.exec.venue_timeout(),
            write_backoff: Backoff {
                max_attempts: cfg.store.write_retries.max(1),
                ..Backoff::from(&cfg.supervisor)
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened(Position),
    Closed { outcome: Outcome, settled_rows: u64 },
    PartiallyClosed { remaining: u32 },
    /// The venue filled nothing; state is unchanged.
    Unfilled { order_id: String },
    DryRun(OrderRequest),
}

/// BUY at the ask plus slippage; falls back to the mid, then the bid.
pub fn buy_limit(q: &QuotedContract, slippage: f64) -> Option<f64> {
    let base = q.ask.filter(|a| *a > 0.0).or_else(|| q.mid())?;
    round_cents(base * (1.0 + slippage))
}

/// SELL at the bid minus slippage; falls back to the mid, then the ask.
pub fn sell_limit(q: &QuotedContract, slippage: f64) -> Option<f64> {
    let base = q.bid.filter(|b| *b > 0.0).or_else(|| q.mid())?;
    round_cents(base * (1.0 - slippage))
}

fn round_cents(px: f64) -> Option<f64> {
    let px = (px * 100.0).round() / 100.0;
    (px.is_finite() && px > 0.0).then_some(px)
}

/// Store write for a fill the venue has already executed.
#[derive(Debug, Clone)]
enum OwedWrite {
    Open { position: Position, entry: LedgerOpen },
    Close(LedgerClose),
    Quantity(u32),
}

impl OwedWrite {
    fn label(&self) -> &'static str {
        match self {
            OwedWrite::Open { .. } => "record open",
            OwedWrite::Close(_) => "record close",
            OwedWrite::Quantity(_) => "update quantity",
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    position: Option<Position>,
    owed: Option<OwedWrite>,
}

type Slot = Arc<KeyLock<KeyState>>;

pub struct Manager {
    venue: Arc<dyn Venue>,
    store: Arc<Store>,
    chains: Arc<ChainCache>,
    supervisor: Arc<Supervisor>,
    risk: RiskEngine,
    settings: ManagerSettings,
    slots: Mutex<HashMap<PositionKey, Slot>>,
}

impl Manager {
    pub fn new(
        venue: Arc<dyn Venue>,
        store: Arc<Store>,
        chains: Arc<ChainCache>,
        supervisor: Arc<Supervisor>,
        risk: RiskEngine,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            venue,
            store,
            chains,
            supervisor,
            risk,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &PositionKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn advance(key: &PositionKey, from: LifecycleState, event: LifecycleEvent) -> LifecycleState {
        match transition(from, event) {
            Ok(to) => {
                debug!(%key, %from, %to, ?event, "transition");
                to
            }
            Err(reason) => {
                warn!(%key, %from, ?event, "unexpected transition: {reason}");
                from
            }
        }
    }

    async fn venue_call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> TradeResult<T> {
        let after = self.settings.venue_timeout;
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| TradeError::VenueTimeout { op, after })?
            .map_err(TradeError::Venue)
    }

    async fn write(&self, key: &PositionKey, write: &OwedWrite) -> TradeResult<u64> {
        let store = &self.store;
        self.settings
            .write_backoff
            .retry(write.label(), move || async move {
                match write {
                    OwedWrite::Open { position, entry } => {
                        match store.record_open(position, entry).await {
                            Ok(()) => Ok(1),
                            // an earlier attempt committed before its error surfaced
                            Err(TradeError::InvariantViolation { .. }) => Ok(0),
                            Err(e) => Err(e),
                        }
                    }
                    OwedWrite::Close(close) => store.record_close(key, close).await,
                    OwedWrite::Quantity(n) => store.update_quantity(key, *n).await.map(|()| 1),
                }
            })
            .await
    }

    /// Write through after a fill; on failure the write stays owed on the key.
    async fn persist(
        &self,
        key: &PositionKey,
        state: &mut KeyState,
        write: OwedWrite,
    ) -> TradeResult<u64> {
        match self.write(key, &write).await {
            Ok(n) => Ok(n),
            Err(e) => {
                state.owed = Some(write);
                Err(e)
            }
        }
    }

    async fn settle_owed(&self, key: &PositionKey, state: &mut KeyState) -> TradeResult<()> {
        let Some(write) = state.owed.take() else {
            return Ok(());
        };
        match self.write(key, &write).await {
            Ok(n) => {
                if n == 0 && matches!(write, OwedWrite::Close(_)) {
                    warn!(%key, "no PENDING ledger row matched the close");
                }
                info!(%key, "owed {} settled", write.label());
                Ok(())
            }
            Err(e) => {
                state.owed = Some(write);
                Err(e)
            }
        }
    }

    /// Retry owed store writes on idle keys; returns how many settled.
    /// Keys busy with a signal settle their own.
    pub async fn settle_pending_writes(&self) -> usize {
        let slots: Vec<(PositionKey, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        let mut settled = 0;
        for (key, slot) in slots {
            let Ok(mut state) = slot.try_lock() else {
                continue;
            };
            if state.owed.is_none() {
                continue;
            }
            match self.settle_owed(&key, &mut state).await {
                Ok(()) => settled += 1,
                Err(e) => error!(%key, "owed store write still failing: {e}"),
            }
        }
        settled
    }

    /// Scheduled connectivity check. Owed store writes are retried once the
    /// store answers; returns how many settled.
    pub async fn health_check(&self) -> usize {
        self.supervisor.ensure_venue(self.venue.as_ref()).await;
        if !self.supervisor.ensure_store(&self.store).await {
            return 0;
        }
        let settled = self.settle_pending_writes().await;
        if settled > 0 {
            info!("settled {settled} owed store write(s)");
        }
        settled
    }

    /// Parse a raw intake payload and process it. Never fails; every outcome
    /// ends up in the log.
    pub async fn process_payload(&self, payload: &str) {
        match parse_signal(payload) {
            Ok(signal) => self.process(signal).await,
            Err(e) => warn!("dropping payload: {e}"),
        }
    }

    pub async fn process(&self, signal: Signal) {
        let key = PositionKey::for_signal(&signal, self.settings.key_includes_right);
        let action = signal.action;
        match self.handle_signal(signal).await {
            Ok(SignalOutcome::Opened(p)) => info!(
                %key,
                contract = %p.contract.display_name(),
                qty = p.quantity,
                price = p.buy_price,
                "position opened"
            ),
            Ok(SignalOutcome::Closed {
                outcome,
                settled_rows,
            }) => info!(%key, %outcome, settled_rows, "position closed"),
            Ok(SignalOutcome::PartiallyClosed { remaining }) => {
                warn!(%key, remaining, "close partially filled, position stays open")
            }
            Ok(SignalOutcome::Unfilled { order_id }) => {
                warn!(%key, order_id, ?action, "order not filled, state unchanged")
            }
            Ok(SignalOutcome::DryRun(order)) => info!(
                %key,
                "[DRY-RUN] {:?} {}x {} @ {:.2}",
                order.side,
                order.quantity,
                order.contract.display_name(),
                order.limit_price
            ),
            Err(e) if e.is_no_trade() => info!(%key, ?action, "no trade: {e}"),
            Err(e @ TradeError::InvariantViolation { .. }) => warn!(?action, "signal dropped: {e}"),
            Err(e) => error!(%key, ?action, "signal failed: {e}"),
        }
    }

    pub async fn handle_signal(&self, signal: Signal) -> TradeResult<SignalOutcome> {
        if !self.supervisor.ensure_venue(self.venue.as_ref()).await {
            return Err(TradeError::VenueDisconnected);
        }
        if !self.supervisor.ensure_store(&self.store).await {
            return Err(TradeError::StoreUnavailable("store did not come back".into()));
        }
        let key = PositionKey::for_signal(&signal, self.settings.key_includes_right);
        match signal.action {
            Action::Buy => self.buy(signal, key).await,
            Action::Sell => self.sell(signal, key).await,
        }
    }

    async fn buy(&self, signal: Signal, key: PositionKey) -> TradeResult<SignalOutcome> {
        // chain lookup happens before the key lock
        let snapshot = self
            .chains
            .get_or_fetch(self.venue.as_ref(), &signal.symbol, self.settings.venue_timeout)
            .await?;

        let slot = self.slot(&key);
        let mut held = slot.lock().await;
        self.settle_owed(&key, &mut held).await?;
        if held.position.is_none() {
            held.position = self.store.load_position(&key).await?;
        }
        let state = transition(
            LifecycleState::at_rest(held.position.is_some()),
            LifecycleEvent::BuySignal,
        )
            .map_err(|reason| TradeError::InvariantViolation {
                key: key.clone(),
                reason: reason.into(),
            })?;
        debug!(%key, %state, "buy accepted");

        let policy = ExpirationPolicy {
            skip_zero_day: self.settings.skip_zero_day,
            today: Local::now().date_naive(),
        };
        let candidates = select_contracts(
            &snapshot,
            signal.entry_price,
            signal.right,
            self.settings.strike_count,
            &policy,
        )?;
        if candidates.is_empty() {
            return Err(TradeError::NoCandidateContracts(format!(
                "{} has no strikes around {}",
                signal.symbol, signal.entry_price
            )));
        }

        let quotes = self
            .venue_call("quote", self.venue.quote(&candidates))
            .await?;
        let chosen = choose_by_delta(&candidates, &quotes, &self.settings.band).ok_or_else(|| {
            TradeError::NoCandidateContracts(format!(
                "{}: no candidate delta acceptable",
                signal.symbol
            ))
        })?;
        let delta = chosen.delta().unwrap_or_default();
        let quantity = self.risk.size(self.settings.balance, delta);
        if quantity == 0 {
            return Err(TradeError::RiskRejected(format!(
                "{} sized to zero contracts (delta {delta:.3})",
                chosen.contract.display_name()
            )));
        }
        let limit_price = buy_limit(&chosen, self.settings.buy_slippage).ok_or_else(|| {
            TradeError::NoCandidateContracts(format!(
                "{} has no usable ask",
                chosen.contract.display_name()
            ))
        })?;
        self.risk.pre_check(quantity, limit_price)?;
        if let Some(suggested) = signal.contracts.filter(|n| *n != quantity) {
            debug!(%key, suggested, sized = quantity, "sender's contract count ignored");
        }

        let order = OrderRequest {
            contract: chosen.contract.clone(),
            side: Side::Buy,
            quantity,
            limit_price,
        };
        if self.settings.dry_run {
            return Ok(SignalOutcome::DryRun(order));
        }

        let exec = self
            .venue_call("submit_order", self.venue.submit_order(&order))
            .await?;
        if exec.filled_qty == 0 {
            debug!(%key, status = ?exec.status, "buy filled nothing");
            Self::advance(&key, state, LifecycleEvent::Aborted);
            return Ok(SignalOutcome::Unfilled {
                order_id: exec.order_id,
            });
        }
        let fill_price = if exec.avg_fill_price > 0.0 {
            exec.avg_fill_price
        } else {
            limit_price
        };
        let quote = QuoteSnapshot::from(&chosen);
        let opened_at = Utc::now();
        let position = Position {
            key: key.clone(),
            contract: chosen.contract.clone(),
            quantity: exec.filled_qty,
            buy_quote: quote,
            buy_price: fill_price,
            opened_at,
        };
        let entry = LedgerOpen {
            signal,
            contract: chosen.contract,
            quantity: exec.filled_qty,
            quote,
            fill_price,
            opened_at,
        };

        // the fill is real from here on, so memory tracks it even if the write fails
        held.position = Some(position.clone());
        Self::advance(&key, state, LifecycleEvent::Filled);
        let write = OwedWrite::Open {
            position: position.clone(),
            entry,
        };
        if let Err(err) = self.persist(&key, &mut held, write).await {
            error!(%key, order_id = exec.order_id, "filled at venue, store write owed: {err}");
            return Err(err);
        }
        Ok(SignalOutcome::Opened(position))
    }

    async fn sell(&self, signal: Signal, key: PositionKey) -> TradeResult<SignalOutcome> {
        let slot = self.slot(&key);
        let mut held = slot.lock().await;
        self.settle_owed(&key, &mut held).await?;
        if held.position.is_none() {
            held.position = self.store.load_position(&key).await?;
            if held.position.is_some() {
                info!(%key, "position resolved from store");
            }
        }
        let state = transition(
            LifecycleState::at_rest(held.position.is_some()),
            LifecycleEvent::SellSignal,
        )
        .map_err(|reason| TradeError::InvariantViolation {
            key: key.clone(),
            reason: reason.into(),
        })?;
        let Some(position) = held.position.clone() else {
            return Err(TradeError::InvariantViolation {
                key,
                reason: "no open position for this key".into(),
            });
        };
        debug!(%key, %state, "sell accepted");

        let quotes = self
            .venue_call("quote", self.venue.quote(std::slice::from_ref(&position.contract)))
            .await?;
        let quoted = quotes
            .into_iter()
            .find(|q| q.contract.chain_key == position.contract.chain_key)
            .ok_or_else(|| {
                TradeError::Venue(anyhow::anyhow!(
                    "no quote for {}",
                    position.contract.display_name()
                ))
            })?;
        let limit_price = sell_limit(&quoted, self.settings.sell_slippage).ok_or_else(|| {
            TradeError::Venue(anyhow::anyhow!(
                "no usable bid for {}",
                position.contract.display_name()
            ))
        })?;

        let order = OrderRequest {
            contract: position.contract.clone(),
            side: Side::Sell,
            quantity: position.quantity,
            limit_price,
        };
        if self.settings.dry_run {
            return Ok(SignalOutcome::DryRun(order));
        }

        let exec = self
            .venue_call("submit_order", self.venue.submit_order(&order))
            .await?;
        if exec.filled_qty == 0 {
            debug!(%key, status = ?exec.status, "sell filled nothing");
            Self::advance(&key, state, LifecycleEvent::Aborted);
            return Ok(SignalOutcome::Unfilled {
                order_id: exec.order_id,
            });
        }

        if exec.filled_qty < position.quantity {
            let remaining = position.quantity - exec.filled_qty;
            Self::advance(&key, state, LifecycleEvent::PartiallyClosed);
            held.position = Some(Position {
                quantity: remaining,
                ..position
            });
            if let Err(err) = self
                .persist(&key, &mut held, OwedWrite::Quantity(remaining))
                .await
            {
                error!(%key, order_id = exec.order_id, "partial close at venue, store write owed: {err}");
                return Err(err);
            }
            return Ok(SignalOutcome::PartiallyClosed { remaining });
        }

        let fill_price = if exec.avg_fill_price > 0.0 {
            exec.avg_fill_price
        } else {
            limit_price
        };
        let outcome = match signal.outcome {
            Outcome::Pending if fill_price > position.buy_price => Outcome::Win,
            Outcome::Pending => Outcome::Loss,
            given => given,
        };
        let close = LedgerClose {
            outcome,
            quote: QuoteSnapshot::from(&quoted),
            fill_price,
            closed_at: Utc::now(),
        };

        held.position = None;
        Self::advance(&key, state, LifecycleEvent::Filled);
        let settled_rows = match self.persist(&key, &mut held, OwedWrite::Close(close)).await {
            Ok(n) => n,
            Err(err) => {
                error!(%key, order_id = exec.order_id, "closed at venue, store write owed: {err}");
                return Err(err);
            }
        };
        if settled_rows == 0 {
            warn!(%key, "no PENDING ledger row matched the close");
        }
        Ok(SignalOutcome::Closed {
            outcome,
            settled_rows,
        })
    }

    /// Log every persisted open position; returns how many there are.
    pub async fn restore(&self) -> TradeResult<usize> {
        let open = self.store.open_positions().await?;
        for p in &open {
            info!(
                key = %p.key,
                contract = %p.contract.display_name(),
                qty = p.quantity,
                price = p.buy_price,
                "open position on record"
            );
        }
        info!("{} open position(s) on record", open.len());
        Ok(open.len())
    }

    /// Compare persisted positions with venue holdings. Only logs; the store
    /// is never changed here. Returns the keys with no matching holding.
    pub async fn reconcile(&self) -> TradeResult<Vec<PositionKey>> {
        let open = self.store.open_positions().await?;
        let holdings = self
            .venue_call("open_contracts", self.venue.open_contracts())
            .await?;
        debug!(
            held = holdings.len(),
            contracts = holdings.iter().map(|h| h.quantity).sum::<u32>(),
            "venue option holdings"
        );
        let missing: Vec<PositionKey> = open
            .into_iter()
            .filter(|p| !holdings.iter().any(|h| h.matches(&p.contract)))
            .map(|p| {
                warn!(
                    key = %p.key,
                    contract = %p.contract.display_name(),
                    "persisted position has no matching venue holding"
                );
                p.key
            })
            .collect();
        Ok(missing)
    }
}
