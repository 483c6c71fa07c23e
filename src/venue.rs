//! Execution venue seam: chains, quotes, orders and connectivity.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    CandidateContract, ChainSnapshot, ExecutionResult, HeldContract, OrderRequest, QuotedContract,
};

/// Webull's session futures are not `Send`, so venue futures stay on the
/// thread that created them and signal tasks run on a `LocalSet`.
#[async_trait(?Send)]
pub trait Venue {
    async fn get_chain(&self, underlying: &str) -> Result<ChainSnapshot>;

    /// One entry per contract the venue could quote; unknown contracts are omitted.
    async fn quote(&self, contracts: &[CandidateContract]) -> Result<Vec<QuotedContract>>;

    /// Place a limit order and wait for it to settle. Whatever has not filled
    /// when the venue gives up is cancelled and reported in `filled_qty`.
    async fn submit_order(&self, order: &OrderRequest) -> Result<ExecutionResult>;

    async fn is_connected(&self) -> bool;

    /// Drop the current session and log in again with a fresh client.
    async fn reconnect(&self) -> Result<()>;

    /// Option holdings currently open at the venue.
    async fn open_contracts(&self) -> Result<Vec<HeldContract>>;
}
