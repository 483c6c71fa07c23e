//! Core domain types for signals, contracts, positions and ledger rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Right {
    Call,
    Put,
}

impl Right {
    pub fn as_str(&self) -> &'static str {
        match self {
            Right::Call => "CALL",
            Right::Put => "PUT",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALL" | "C" => Some(Right::Call),
            "PUT" | "P" => Some(Right::Put),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Right::Call => 'C',
            Right::Put => 'P',
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Loss,
    Pending,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "WIN",
            Outcome::Loss => "LOSS",
            Outcome::Pending => "PENDING",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "W" | "WIN" => Some(Outcome::Win),
            "L" | "LOSS" => Some(Outcome::Loss),
            "P" | "PENDING" => Some(Outcome::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trading decision as received from the intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub condition: String,
    pub right: Right,
    pub action: Action,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub outcome: Outcome,
    /// Contract count suggested by the sender. Informational only; sizing is ours.
    pub contracts: Option<u32>,
    pub afterhours: bool,
}

/// Identity of a position slot. `right` is `None` when calls and puts share a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub condition: String,
    pub right: Option<Right>,
}

impl PositionKey {
    pub fn for_signal(signal: &Signal, includes_right: bool) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            condition: signal.condition.clone(),
            right: includes_right.then_some(signal.right),
        }
    }

    /// Column value used for the `key_right` part of the positions primary key.
    pub fn right_column(&self) -> &'static str {
        self.right.map(|r| r.as_str()).unwrap_or("ANY")
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.symbol, self.condition, self.right_column())
    }
}

/// Point-in-time strikes and expirations for one underlying.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub underlying: String,
    strikes: Vec<f64>,
    expirations: Vec<NaiveDate>,
    pub as_of: DateTime<Utc>,
}

impl ChainSnapshot {
    /// Sorts and dedups the inputs so strikes are strictly increasing and
    /// expirations chronological. Non-finite or non-positive strikes are dropped.
    pub fn new(
        underlying: &str,
        mut strikes: Vec<f64>,
        mut expirations: Vec<NaiveDate>,
        as_of: DateTime<Utc>,
    ) -> Self {
        strikes.retain(|s| s.is_finite() && *s > 0.0);
        strikes.sort_by(|a, b| a.total_cmp(b));
        strikes.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
        expirations.sort();
        expirations.dedup();
        Self {
            underlying: underlying.to_ascii_uppercase(),
            strikes,
            expirations,
            as_of,
        }
    }

    pub fn strikes(&self) -> &[f64] {
        &self.strikes
    }

    pub fn expirations(&self) -> &[NaiveDate] {
        &self.expirations
    }
}

/// A not-yet-priced contract descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateContract {
    pub symbol: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub right: Right,
    /// OCC-style identifier, e.g. `AAPL240119C00150000`.
    pub chain_key: String,
}

impl CandidateContract {
    pub fn new(symbol: &str, expiration: NaiveDate, strike: f64, right: Right) -> Self {
        let symbol = symbol.to_ascii_uppercase();
        let chain_key = occ_symbol(&symbol, expiration, strike, right);
        Self {
            symbol,
            expiration,
            strike,
            right,
            chain_key,
        }
    }

    pub fn display_name(&self) -> String {
        format!(
            "{} {}{} {}",
            self.symbol,
            self.strike,
            self.right.letter(),
            self.expiration
        )
    }
}

pub fn occ_symbol(symbol: &str, expiration: NaiveDate, strike: f64, right: Right) -> String {
    let milli_strike = (strike * 1000.0).round() as i64;
    format!(
        "{}{}{}{:08}",
        symbol.to_ascii_uppercase(),
        expiration.format("%y%m%d"),
        right.letter(),
        milli_strike
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub implied_vol: f64,
}

/// Candidate plus a quote taken at one instant. `greeks` is `None` when the
/// venue could not produce them.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotedContract {
    pub contract: CandidateContract,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub greeks: Option<Greeks>,
}

impl QuotedContract {
    pub fn delta(&self) -> Option<f64> {
        self.greeks.map(|g| g.delta).filter(|d| d.is_finite())
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 => Some((a + b) / 2.0),
            (Some(b), _) if b > 0.0 => Some(b),
            (_, Some(a)) if a > 0.0 => Some(a),
            _ => None,
        }
    }
}

/// Quote fields copied onto the position and ledger at order time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub greeks: Greeks,
}

impl From<&QuotedContract> for QuoteSnapshot {
    fn from(q: &QuotedContract) -> Self {
        Self {
            bid: q.bid,
            ask: q.ask,
            greeks: q.greeks.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub contract: CandidateContract,
    pub side: Side,
    pub quantity: u32,
    pub limit_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    Unfilled,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub order_id: String,
    pub status: FillStatus,
    pub filled_qty: u32,
    pub avg_fill_price: f64,
}

/// The unit of state that must survive restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub key: PositionKey,
    pub contract: CandidateContract,
    pub quantity: u32,
    pub buy_quote: QuoteSnapshot,
    pub buy_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// Open-side ledger row as written at BUY time.
#[derive(Debug, Clone)]
pub struct LedgerOpen {
    pub signal: Signal,
    pub contract: CandidateContract,
    pub quantity: u32,
    pub quote: QuoteSnapshot,
    pub fill_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// Close-side fields applied to the matching PENDING ledger row.
#[derive(Debug, Clone)]
pub struct LedgerClose {
    pub outcome: Outcome,
    pub quote: QuoteSnapshot,
    pub fill_price: f64,
    pub closed_at: DateTime<Utc>,
}

/// Option holding as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldContract {
    pub symbol: String,
    pub strike: f64,
    pub right: Right,
    pub expiration: Option<NaiveDate>,
    pub quantity: u32,
}

impl HeldContract {
    pub fn matches(&self, contract: &CandidateContract) -> bool {
        self.symbol.eq_ignore_ascii_case(&contract.symbol)
            && (self.strike - contract.strike).abs() < 1e-6
            && self.right == contract.right
            && self.expiration.map_or(true, |e| e == contract.expiration)
    }
}
