//! Connectivity supervision for the venue and the store, with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::SupervisorCfg;
use crate::store::Store;
use crate::venue::Venue;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// 0 retries until success.
    pub max_attempts: u32,
}

impl From<&SupervisorCfg> for Backoff {
    fn from(cfg: &SupervisorCfg) -> Self {
        Self {
            initial: Duration::from_millis(cfg.backoff_initial_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
            multiplier: cfg.backoff_multiplier,
            max_attempts: cfg.max_attempts,
        }
    }
}

impl Backoff {
    /// `min(initial * multiplier^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }

    /// Run `op` until it succeeds or attempts run out, sleeping between tries.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if self.exhausted(attempt) {
                        return Err(e);
                    }
                    let wait = self.delay(attempt - 1);
                    warn!("{what} failed (attempt {attempt}): {e}; retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

pub struct Supervisor {
    backoff: Backoff,
}

impl Supervisor {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// True when the venue is reachable, reconnecting with backoff if needed.
    pub async fn ensure_venue(&self, venue: &dyn Venue) -> bool {
        if venue.is_connected().await {
            return true;
        }
        warn!("venue disconnected, reconnecting");
        let outcome = self
            .backoff
            .retry("venue reconnect", move || async move {
                venue.reconnect().await?;
                if venue.is_connected().await {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("still disconnected after reconnect"))
                }
            })
            .await;
        match outcome {
            Ok(()) => {
                info!("venue reconnected");
                true
            }
            Err(e) => {
                error!("venue reconnect gave up: {e:#}");
                false
            }
        }
    }

    /// True when the store answers, reopening the pool with backoff if needed.
    pub async fn ensure_store(&self, store: &Store) -> bool {
        if store.ping().await.is_ok() {
            return true;
        }
        warn!("store unreachable, reopening");
        let outcome = self
            .backoff
            .retry("store reconnect", move || async move {
                store.reconnect().await?;
                store.ping().await
            })
            .await;
        match outcome {
            Ok(()) => {
                info!("store reconnected");
                true
            }
            Err(e) => {
                error!("store reconnect gave up: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockVenue;
    use std::sync::atomic::Ordering;

    fn fast(max_attempts: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn delay_grows_then_caps() {
        let b = Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        };
        assert_eq!(b.delay(0), Duration::from_millis(500));
        assert_eq!(b.delay(1), Duration::from_millis(1000));
        assert_eq!(b.delay(3), Duration::from_millis(4000));
        assert_eq!(b.delay(10), Duration::from_secs(30));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn unit_multiplier_is_constant() {
        let b = Backoff {
            multiplier: 1.0,
            ..fast(0)
        };
        assert_eq!(b.delay(0), b.delay(7));
    }

    #[tokio::test]
    async fn connected_venue_is_not_touched() {
        let venue = MockVenue::default();
        assert!(Supervisor::new(fast(3)).ensure_venue(&venue).await);
        assert_eq!(venue.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn venue_reconnects_after_failures() {
        let venue = MockVenue::default();
        venue.connected.store(false, Ordering::SeqCst);
        venue.reconnect_failures.store(2, Ordering::SeqCst);
        assert!(Supervisor::new(fast(5)).ensure_venue(&venue).await);
        assert_eq!(venue.reconnects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn venue_gives_up_after_max_attempts() {
        let venue = MockVenue::default();
        venue.connected.store(false, Ordering::SeqCst);
        venue.reconnect_failures.store(100, Ordering::SeqCst);
        assert!(!Supervisor::new(fast(3)).ensure_venue(&venue).await);
        assert_eq!(venue.reconnects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_reopens_after_close() {
        let store = Store::in_memory().await.unwrap();
        store.close().await;
        assert!(Supervisor::new(fast(2)).ensure_store(&store).await);
        assert!(store.ping().await.is_ok());
    }
}
