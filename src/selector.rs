//! Contract selection: expiration policy, strike short-list and delta targeting.

use chrono::NaiveDate;
use tracing::debug;

use crate::config::{FallbackPolicy, SelectionCfg};
use crate::error::TradeError;
use crate::types::{CandidateContract, ChainSnapshot, QuotedContract, Right};

#[derive(Debug, Clone, Copy)]
pub struct ExpirationPolicy {
    pub skip_zero_day: bool,
    pub today: NaiveDate,
}

/// Band on |delta|, exclusive at both edges, plus the fallback used when no
/// quote lands inside it.
#[derive(Debug, Clone, Copy)]
pub struct DeltaBand {
    pub lower: f64,
    pub upper: f64,
    pub target: f64,
    pub fallback: FallbackPolicy,
}

impl From<&SelectionCfg> for DeltaBand {
    fn from(cfg: &SelectionCfg) -> Self {
        Self {
            lower: cfg.delta_lower,
            upper: cfg.delta_upper,
            target: cfg.delta_target,
            fallback: cfg.fallback,
        }
    }
}

impl DeltaBand {
    fn contains(&self, abs_delta: f64) -> bool {
        self.lower < abs_delta && abs_delta < self.upper
    }

    fn distance_to_edge(&self, abs_delta: f64) -> f64 {
        if abs_delta <= self.lower {
            self.lower - abs_delta
        } else {
            abs_delta - self.upper
        }
    }
}

/// Earliest usable expiration among the first two listed. A same-day expiry
/// is skipped in favour of the next one when the policy says so.
pub fn choose_expiration(
    expirations: &[NaiveDate],
    policy: &ExpirationPolicy,
) -> Option<NaiveDate> {
    let mut live = expirations.iter().copied().filter(|e| *e >= policy.today);
    let first = live.next()?;
    if policy.skip_zero_day && first == policy.today {
        debug!(%first, "zero-day expiration, using the next one");
        return live.next();
    }
    Some(first)
}

/// Up to `strike_count` strikes strictly below the entry price followed by up
/// to `strike_count` strictly above it, all at the chosen expiration.
///
/// An empty result means the chain had no usable strikes; callers treat that
/// as "do not trade".
pub fn select_contracts(
    snapshot: &ChainSnapshot,
    entry_price: f64,
    right: Right,
    strike_count: usize,
    policy: &ExpirationPolicy,
) -> Result<Vec<CandidateContract>, TradeError> {
    let expiration = choose_expiration(snapshot.expirations(), policy)
        .ok_or_else(|| TradeError::NoValidExpiration(snapshot.underlying.clone()))?;

    let strikes = snapshot.strikes();
    let below: Vec<f64> = strikes.iter().copied().filter(|s| *s < entry_price).collect();
    let above = strikes.iter().copied().filter(|s| *s > entry_price);

    let below_start = below.len().saturating_sub(strike_count);
    let candidates: Vec<CandidateContract> = below[below_start..]
        .iter()
        .copied()
        .chain(above.take(strike_count))
        .map(|strike| CandidateContract::new(&snapshot.underlying, expiration, strike, right))
        .collect();

    debug!(
        symbol = %snapshot.underlying,
        %expiration,
        entry_price,
        count = candidates.len(),
        "short-listed candidates"
    );
    Ok(candidates)
}

/// Pick one quoted candidate by delta. Quotes for contracts not in
/// `candidates`, with no delta, or with a delta of the wrong sign for the
/// right are ignored.
pub fn choose_by_delta(
    candidates: &[CandidateContract],
    quotes: &[QuotedContract],
    band: &DeltaBand,
) -> Option<QuotedContract> {
    let usable: Vec<(&QuotedContract, f64)> = candidates
        .iter()
        .filter_map(|c| quotes.iter().find(|q| q.contract.chain_key == c.chain_key))
        .filter_map(|q| {
            let delta = q.delta()?;
            let signed_ok = match q.contract.right {
                Right::Call => delta > 0.0,
                Right::Put => delta < 0.0,
            };
            signed_ok.then_some((q, delta.abs()))
        })
        .collect();

    let in_band = usable
        .iter()
        .filter(|(_, a)| band.contains(*a))
        .min_by(|(_, a), (_, b)| (a - band.target).abs().total_cmp(&(b - band.target).abs()));
    if let Some((q, _)) = in_band {
        return Some((*q).clone());
    }

    let fallback = match band.fallback {
        FallbackPolicy::NoTrade => None,
        FallbackPolicy::ClosestToBand => usable
            .iter()
            .min_by(|(_, a), (_, b)| band.distance_to_edge(*a).total_cmp(&band.distance_to_edge(*b))),
        FallbackPolicy::MostInTheMoney => usable.iter().max_by(|(_, a), (_, b)| a.total_cmp(b)),
    };
    if let Some((q, a)) = fallback {
        debug!(contract = %q.contract.display_name(), abs_delta = a, policy = ?band.fallback, "no delta in band, using fallback");
    }
    fallback.map(|(q, _)| (*q).clone())
}
