//! Per-key position lifecycle: NONE -> PENDING_OPEN -> OPEN -> PENDING_CLOSE -> NONE.
//!
//! Pending states exist only while the key's lock is held; at rest a key is
//! either NONE (no position) or OPEN.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    None,
    PendingOpen,
    Open,
    PendingClose,
}

impl LifecycleState {
    pub fn at_rest(has_position: bool) -> Self {
        if has_position {
            LifecycleState::Open
        } else {
            LifecycleState::None
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::None => "NONE",
            LifecycleState::PendingOpen => "PENDING_OPEN",
            LifecycleState::Open => "OPEN",
            LifecycleState::PendingClose => "PENDING_CLOSE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BuySignal,
    SellSignal,
    /// Venue filled the whole order.
    Filled,
    /// Closing order filled only part of the position.
    PartiallyClosed,
    /// Nothing filled, or selection/sizing decided not to trade.
    Aborted,
}

pub fn transition(
    state: LifecycleState,
    event: LifecycleEvent,
) -> Result<LifecycleState, &'static str> {
    use LifecycleEvent as E;
    use LifecycleState as S;
    match (state, event) {
        (S::None, E::BuySignal) => Ok(S::PendingOpen),
        (S::Open, E::SellSignal) => Ok(S::PendingClose),
        (S::PendingOpen, E::Filled) => Ok(S::Open),
        (S::PendingOpen, E::Aborted) => Ok(S::None),
        (S::PendingClose, E::Filled) => Ok(S::None),
        (S::PendingClose, E::PartiallyClosed | E::Aborted) => Ok(S::Open),
        (S::Open | S::PendingOpen | S::PendingClose, E::BuySignal) => {
            Err("a position is already open for this key")
        }
        (S::None, E::SellSignal) => Err("no open position for this key"),
        (S::PendingOpen | S::PendingClose, E::SellSignal) => {
            Err("another signal for this key is in flight")
        }
        _ => Err("event does not apply in this state"),
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleEvent as E;
    use super::LifecycleState as S;
    use super::*;

    #[test]
    fn full_cycle() {
        let mut s = S::None;
        for ev in [E::BuySignal, E::Filled, E::SellSignal, E::Filled] {
            s = transition(s, ev).unwrap();
        }
        assert_eq!(s, S::None);
    }

    #[test]
    fn aborts_return_to_rest() {
        assert_eq!(transition(S::PendingOpen, E::Aborted), Ok(S::None));
        assert_eq!(transition(S::PendingClose, E::Aborted), Ok(S::Open));
        assert_eq!(transition(S::PendingClose, E::PartiallyClosed), Ok(S::Open));
    }

    #[test]
    fn reentrant_signals_rejected() {
        assert!(transition(S::Open, E::BuySignal).is_err());
        assert!(transition(S::None, E::SellSignal).is_err());
        assert!(transition(S::PendingOpen, E::SellSignal).is_err());
        assert!(transition(S::None, E::Filled).is_err());
    }

    #[test]
    fn display_names() {
        assert_eq!(S::PendingClose.to_string(), "PENDING_CLOSE");
        assert_eq!(S::at_rest(true), S::Open);
    }
}
