//! Error taxonomy for signal processing. Everything here is handled at the
//! signal boundary; none of it stops the process.

use std::time::Duration;
use thiserror::Error;

use crate::types::PositionKey;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("no valid expiration for {0}")]
    NoValidExpiration(String),

    #[error("no candidate contracts for {0}")]
    NoCandidateContracts(String),

    #[error("no options chain available for {0}")]
    ChainUnavailable(String),

    #[error("venue disconnected")]
    VenueDisconnected,

    #[error("venue call `{op}` timed out after {after:?}")]
    VenueTimeout { op: &'static str, after: Duration },

    #[error("venue error: {0:#}")]
    Venue(anyhow::Error),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invariant violation on {key}: {reason}")]
    InvariantViolation { key: PositionKey, reason: String },

    #[error("risk rejected: {0}")]
    RiskRejected(String),

    #[error("signal parse error: {0}")]
    SignalParse(String),
}

impl TradeError {
    /// "Do not trade" outcomes: expected, not failures.
    pub fn is_no_trade(&self) -> bool {
        matches!(
            self,
            TradeError::NoValidExpiration(_)
                | TradeError::NoCandidateContracts(_)
                | TradeError::RiskRejected(_)
        )
    }
}

impl From<sqlx::Error> for TradeError {
    fn from(e: sqlx::Error) -> Self {
        TradeError::StoreUnavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for TradeError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        TradeError::StoreUnavailable(e.to_string())
    }
}

pub type TradeResult<T> = Result<T, TradeError>;
