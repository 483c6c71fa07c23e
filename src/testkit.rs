//! Scripted in-process venue and fixtures shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};

use crate::types::{
    Action, CandidateContract, ChainSnapshot, ExecutionResult, FillStatus, Greeks, HeldContract,
    OrderRequest, Outcome, QuotedContract, Right, Signal,
};
use crate::venue::Venue;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
}

pub fn signal(symbol: &str, condition: &str, right: Right, action: Action) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        condition: condition.to_string(),
        right,
        action,
        entry_price: 150.0,
        stop_loss: Some(148.0),
        take_profit: Some(155.0),
        outcome: Outcome::Pending,
        contracts: None,
        afterhours: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillPlan {
    Full,
    Partial(u32),
    Nothing,
    Reject,
}

type QuoteKey = (i64, Right);

fn quote_key(strike: f64, right: Right) -> QuoteKey {
    ((strike * 1000.0).round() as i64, right)
}

pub struct MockVenue {
    pub connected: AtomicBool,
    pub reconnect_failures: AtomicU32,
    pub reconnects: AtomicU32,
    pub chain_fetches: AtomicU32,
    pub fail_chain: AtomicBool,
    chains: Mutex<HashMap<String, ChainSnapshot>>,
    quotes: Mutex<HashMap<QuoteKey, (Option<f64>, Option<f64>, Option<f64>)>>,
    pub fill: Mutex<FillPlan>,
    pub submit_delay: Mutex<Duration>,
    pub orders: Mutex<Vec<OrderRequest>>,
    pub held: Mutex<Vec<HeldContract>>,
}

impl Default for MockVenue {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            reconnect_failures: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            chain_fetches: AtomicU32::new(0),
            fail_chain: AtomicBool::new(false),
            chains: Mutex::default(),
            quotes: Mutex::default(),
            fill: Mutex::new(FillPlan::Full),
            submit_delay: Mutex::new(Duration::ZERO),
            orders: Mutex::default(),
            held: Mutex::default(),
        }
    }
}

impl MockVenue {
    pub fn with_chain(symbol: &str, strikes: &[f64], expirations: &[&str]) -> Self {
        let venue = Self::default();
        venue.set_chain(symbol, strikes, expirations);
        venue
    }

    /// Chain expiring next week and the week after, with every strike quoted
    /// at 2.00/2.10. Calls carry the given delta, puts `delta - 1`.
    pub fn listed(symbol: &str, strikes_and_call_deltas: &[(f64, f64)]) -> Self {
        let venue = Self::default();
        let today = Local::now().date_naive();
        let exps = vec![today + chrono::Duration::days(7), today + chrono::Duration::days(14)];
        let strikes = strikes_and_call_deltas.iter().map(|(s, _)| *s).collect();
        venue
            .chains
            .lock()
            .unwrap()
            .insert(symbol.to_string(), ChainSnapshot::new(symbol, strikes, exps, Utc::now()));
        for (strike, delta) in strikes_and_call_deltas {
            venue.set_quote(*strike, Right::Call, Some(2.0), Some(2.1), Some(*delta));
            venue.set_quote(*strike, Right::Put, Some(2.0), Some(2.1), Some(delta - 1.0));
        }
        venue
    }

    pub fn set_chain(&self, symbol: &str, strikes: &[f64], expirations: &[&str]) {
        let snap = ChainSnapshot::new(
            symbol,
            strikes.to_vec(),
            expirations.iter().map(|e| date(e)).collect(),
            Utc::now(),
        );
        self.chains.lock().unwrap().insert(symbol.to_string(), snap);
    }

    pub fn set_quote(
        &self,
        strike: f64,
        right: Right,
        bid: Option<f64>,
        ask: Option<f64>,
        delta: Option<f64>,
    ) {
        self.quotes
            .lock()
            .unwrap()
            .insert(quote_key(strike, right), (bid, ask, delta));
    }

    pub fn set_fill(&self, plan: FillPlan) {
        *self.fill.lock().unwrap() = plan;
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn last_order(&self) -> Option<OrderRequest> {
        self.orders.lock().unwrap().last().cloned()
    }
}

#[async_trait(?Send)]
impl Venue for MockVenue {
    async fn get_chain(&self, underlying: &str) -> Result<ChainSnapshot> {
        self.chain_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_chain.load(Ordering::SeqCst) {
            bail!("chain service down");
        }
        match self.chains.lock().unwrap().get(underlying) {
            Some(snap) => Ok(snap.clone()),
            None => bail!("unknown underlying {underlying}"),
        }
    }

    async fn quote(&self, contracts: &[CandidateContract]) -> Result<Vec<QuotedContract>> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        let quotes = self.quotes.lock().unwrap();
        Ok(contracts
            .iter()
            .filter_map(|c| {
                let (bid, ask, delta) = quotes.get(&quote_key(c.strike, c.right))?;
                Some(QuotedContract {
                    contract: c.clone(),
                    bid: *bid,
                    ask: *ask,
                    greeks: delta.map(|delta| Greeks {
                        delta,
                        gamma: 0.05,
                        theta: -0.04,
                        implied_vol: 0.3,
                    }),
                })
            })
            .collect())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<ExecutionResult> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        self.orders.lock().unwrap().push(order.clone());
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let order_id = format!("mock-{}", self.order_count());
        let plan = *self.fill.lock().unwrap();
        let (status, filled_qty) = match plan {
            FillPlan::Full => (FillStatus::Filled, order.quantity),
            FillPlan::Partial(n) => (FillStatus::PartiallyFilled, n.min(order.quantity)),
            FillPlan::Nothing => (FillStatus::Unfilled, 0),
            FillPlan::Reject => (FillStatus::Rejected("mock reject".into()), 0),
        };
        Ok(ExecutionResult {
            order_id,
            status,
            filled_qty,
            avg_fill_price: if filled_qty > 0 { order.limit_price } else { 0.0 },
        })
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let left = self.reconnect_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.reconnect_failures.store(left - 1, Ordering::SeqCst);
            bail!("gateway refused connection");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_contracts(&self) -> Result<Vec<HeldContract>> {
        Ok(self.held.lock().unwrap().clone())
    }
}
