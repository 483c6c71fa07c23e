//! Durable position store and signal ledger on sqlite.
//!
//! Opening a position writes the `positions` row and its PENDING `ledger` row
//! in one transaction; closing deletes the row and settles the newest
//! matching PENDING ledger entry in one transaction.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{TradeError, TradeResult};
use crate::types::{
    CandidateContract, Greeks, LedgerClose, LedgerOpen, Outcome, Position, PositionKey,
    QuoteSnapshot, Right,
};

pub struct Store {
    url: String,
    pool: RwLock<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct PositionRow {
    symbol: String,
    condition: String,
    key_right: String,
    option_right: String,
    expiration: NaiveDate,
    strike: f64,
    quantity: i64,
    chain_key: String,
    buy_price: f64,
    bid: Option<f64>,
    ask: Option<f64>,
    delta: f64,
    gamma: f64,
    theta: f64,
    implied_vol: f64,
    opened_at: DateTime<Utc>,
}

impl PositionRow {
    fn into_position(self) -> TradeResult<Position> {
        let corrupt = |what: &str| {
            TradeError::StoreUnavailable(format!(
                "corrupt positions row {}/{}: bad {what}",
                self.symbol, self.condition
            ))
        };
        let right = Right::from_code(&self.option_right).ok_or_else(|| corrupt("option_right"))?;
        let key_right = match self.key_right.as_str() {
            "ANY" => None,
            other => Some(Right::from_code(other).ok_or_else(|| corrupt("key_right"))?),
        };
        let quantity = u32::try_from(self.quantity).map_err(|_| corrupt("quantity"))?;
        let contract = CandidateContract::new(&self.symbol, self.expiration, self.strike, right);
        if contract.chain_key != self.chain_key {
            return Err(corrupt("chain_key"));
        }
        Ok(Position {
            key: PositionKey {
                symbol: self.symbol.clone(),
                condition: self.condition.clone(),
                right: key_right,
            },
            contract,
            quantity,
            buy_quote: QuoteSnapshot {
                bid: self.bid,
                ask: self.ask,
                greeks: Greeks {
                    delta: self.delta,
                    gamma: self.gamma,
                    theta: self.theta,
                    implied_vol: self.implied_vol,
                },
            },
            buy_price: self.buy_price,
            opened_at: self.opened_at,
        })
    }
}

/// Ledger counts by outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeSummary {
    pub wins: i64,
    pub losses: i64,
    pub pending: i64,
}

#[cfg(test)]
#[derive(Debug, FromRow)]
pub struct LedgerRow {
    pub id: i64,
    pub option_right: String,
    pub quantity: i64,
    pub outcome: String,
    pub buy_fill_price: Option<f64>,
    pub sell_fill_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

const POSITION_COLUMNS: &str = "symbol, condition, key_right, option_right, expiration, strike, \
     quantity, chain_key, buy_price, bid, ask, delta, gamma, theta, implied_vol, opened_at";

async fn open_pool(url: &str) -> TradeResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // an in-memory database lives only as long as its single connection
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

impl Store {
    pub async fn connect(url: &str) -> TradeResult<Self> {
        let pool = open_pool(url).await?;
        info!("store ready at {url}");
        Ok(Self {
            url: url.to_string(),
            pool: RwLock::new(pool),
        })
    }

    #[cfg(test)]
    pub async fn in_memory() -> TradeResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    pub async fn ping(&self) -> TradeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool().await).await?;
        Ok(())
    }

    /// Replace the pool with a freshly opened one. An in-memory url reopens empty.
    pub async fn reconnect(&self) -> TradeResult<()> {
        let fresh = open_pool(&self.url).await?;
        let stale = std::mem::replace(&mut *self.pool.write().await, fresh);
        stale.close().await;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    pub async fn load_position(&self, key: &PositionKey) -> TradeResult<Option<Position>> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE symbol = ?1 AND condition = ?2 AND key_right = ?3"
        );
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(&key.symbol)
            .bind(&key.condition)
            .bind(key.right_column())
            .fetch_optional(&self.pool().await)
            .await?;
        row.map(PositionRow::into_position).transpose()
    }

    pub async fn open_positions(&self) -> TradeResult<Vec<Position>> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions ORDER BY opened_at");
        sqlx::query_as::<_, PositionRow>(&sql)
            .fetch_all(&self.pool().await)
            .await?
            .into_iter()
            .map(PositionRow::into_position)
            .collect()
    }

    /// Persist a new position and its PENDING ledger row atomically. A row
    /// already present for the key is an invariant violation.
    pub async fn record_open(&self, position: &Position, entry: &LedgerOpen) -> TradeResult<()> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        let key = &position.key;
        let c = &position.contract;
        let q = &position.buy_quote;
        let sql = format!(
            "INSERT INTO positions ({POSITION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        );
        let inserted = sqlx::query(&sql)
            .bind(&key.symbol)
            .bind(&key.condition)
            .bind(key.right_column())
            .bind(c.right.as_str())
            .bind(c.expiration)
            .bind(c.strike)
            .bind(i64::from(position.quantity))
            .bind(&c.chain_key)
            .bind(position.buy_price)
            .bind(q.bid)
            .bind(q.ask)
            .bind(q.greeks.delta)
            .bind(q.greeks.gamma)
            .bind(q.greeks.theta)
            .bind(q.greeks.implied_vol)
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await;
        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(TradeError::InvariantViolation {
                    key: key.clone(),
                    reason: "a position is already persisted for this key".into(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let s = &entry.signal;
        let g = &entry.quote.greeks;
        sqlx::query(
            r"
            INSERT INTO ledger (
                symbol, condition, action, option_right, quantity, strike, expiration,
                entry_price, stop_loss, take_profit, afterhours,
                buy_bid, buy_ask, buy_delta, buy_gamma, buy_theta, buy_iv, buy_fill_price,
                outcome, opened_at
            )
            VALUES (?1, ?2, 'BUY', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, 'PENDING', ?18)
            ",
        )
        .bind(&s.symbol)
        .bind(&s.condition)
        .bind(entry.contract.right.as_str())
        .bind(i64::from(entry.quantity))
        .bind(entry.contract.strike)
        .bind(entry.contract.expiration)
        .bind(s.entry_price)
        .bind(s.stop_loss)
        .bind(s.take_profit)
        .bind(s.afterhours)
        .bind(entry.quote.bid)
        .bind(entry.quote.ask)
        .bind(g.delta)
        .bind(g.gamma)
        .bind(g.theta)
        .bind(g.implied_vol)
        .bind(entry.fill_price)
        .bind(entry.opened_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete the position for `key` and settle the newest matching PENDING
    /// BUY ledger row. Returns how many ledger rows were settled (0 or 1).
    pub async fn record_close(&self, key: &PositionKey, close: &LedgerClose) -> TradeResult<u64> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM positions WHERE symbol = ?1 AND condition = ?2 AND key_right = ?3")
            .bind(&key.symbol)
            .bind(&key.condition)
            .bind(key.right_column())
            .execute(&mut *tx)
            .await?;

        let g = &close.quote.greeks;
        let settled = sqlx::query(
            r"
            UPDATE ledger
            SET outcome = ?1, sell_bid = ?2, sell_ask = ?3, sell_delta = ?4, sell_gamma = ?5,
                sell_theta = ?6, sell_iv = ?7, sell_fill_price = ?8, closed_at = ?9
            WHERE id = (
                SELECT id FROM ledger
                WHERE symbol = ?10 AND condition = ?11 AND action = 'BUY'
                  AND outcome = 'PENDING' AND (?12 IS NULL OR option_right = ?12)
                ORDER BY id DESC
                LIMIT 1
            )
            ",
        )
        .bind(close.outcome.as_str())
        .bind(close.quote.bid)
        .bind(close.quote.ask)
        .bind(g.delta)
        .bind(g.gamma)
        .bind(g.theta)
        .bind(g.implied_vol)
        .bind(close.fill_price)
        .bind(close.closed_at)
        .bind(&key.symbol)
        .bind(&key.condition)
        .bind(key.right.map(|r| r.as_str()))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(settled)
    }

    /// Shrink an open position after a partial close.
    pub async fn update_quantity(&self, key: &PositionKey, quantity: u32) -> TradeResult<()> {
        sqlx::query(
            "UPDATE positions SET quantity = ?1 WHERE symbol = ?2 AND condition = ?3 AND key_right = ?4",
        )
        .bind(i64::from(quantity))
        .bind(&key.symbol)
        .bind(&key.condition)
        .bind(key.right_column())
        .execute(&self.pool().await)
        .await?;
        Ok(())
    }

    /// Ledger rows opened or closed since `since`, counted by outcome.
    pub async fn outcome_summary(&self, since: DateTime<Utc>) -> TradeResult<OutcomeSummary> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r"
            SELECT outcome, COUNT(*) FROM ledger
            WHERE opened_at >= ?1 OR closed_at >= ?1
            GROUP BY outcome
            ",
        )
        .bind(since)
        .fetch_all(&self.pool().await)
        .await?;

        let mut summary = OutcomeSummary::default();
        for (outcome, n) in rows {
            match Outcome::from_code(&outcome) {
                Some(Outcome::Win) => summary.wins += n,
                Some(Outcome::Loss) => summary.losses += n,
                Some(Outcome::Pending) => summary.pending += n,
                None => {}
            }
        }
        Ok(summary)
    }

    #[cfg(test)]
    pub async fn ledger_rows(&self, symbol: &str, condition: &str) -> TradeResult<Vec<LedgerRow>> {
        Ok(sqlx::query_as::<_, LedgerRow>(
            r"
            SELECT id, option_right, quantity, outcome, buy_fill_price, sell_fill_price, closed_at
            FROM ledger WHERE symbol = ?1 AND condition = ?2 ORDER BY id
            ",
        )
        .bind(symbol)
        .bind(condition)
        .fetch_all(&self.pool().await)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{date, signal};
    use crate::types::Action;

    fn position(key: PositionKey, strike: f64, qty: u32) -> Position {
        let right = key.right.unwrap_or(Right::Call);
        Position {
            contract: CandidateContract::new(&key.symbol, date("20240119"), strike, right),
            key,
            quantity: qty,
            buy_quote: QuoteSnapshot {
                bid: Some(2.0),
                ask: Some(2.1),
                greeks: Greeks {
                    delta: 0.42,
                    gamma: 0.05,
                    theta: -0.03,
                    implied_vol: 0.31,
                },
            },
            buy_price: 2.1,
            opened_at: Utc::now(),
        }
    }

    fn ledger_open(p: &Position) -> LedgerOpen {
        LedgerOpen {
            signal: signal(&p.key.symbol, &p.key.condition, p.contract.right, Action::Buy),
            contract: p.contract.clone(),
            quantity: p.quantity,
            quote: p.buy_quote,
            fill_price: p.buy_price,
            opened_at: p.opened_at,
        }
    }

    fn close(outcome: Outcome) -> LedgerClose {
        LedgerClose {
            outcome,
            quote: QuoteSnapshot::default(),
            fill_price: 2.6,
            closed_at: Utc::now(),
        }
    }

    fn key(sym: &str, right: Option<Right>) -> PositionKey {
        PositionKey {
            symbol: sym.into(),
            condition: "breakout".into(),
            right,
        }
    }

    #[tokio::test]
    async fn open_then_load_round_trips() {
        let store = Store::in_memory().await.unwrap();
        let p = position(key("AAPL", Some(Right::Call)), 150.0, 3);
        store.record_open(&p, &ledger_open(&p)).await.unwrap();

        let loaded = store.load_position(&p.key).await.unwrap().unwrap();
        assert_eq!(loaded.contract, p.contract);
        assert_eq!(loaded.quantity, 3);
        assert_eq!(loaded.buy_quote, p.buy_quote);
        assert_eq!(store.open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_persists_chain_key() {
        let store = Store::in_memory().await.unwrap();
        let p = position(key("TSLA", Some(Right::Put)), 240.0, 1);
        store.record_open(&p, &ledger_open(&p)).await.unwrap();

        let stored: String = sqlx::query_scalar("SELECT chain_key FROM positions WHERE symbol = 'TSLA'")
            .fetch_one(&store.pool().await)
            .await
            .unwrap();
        assert_eq!(stored, p.contract.chain_key);
        let loaded = store.load_position(&p.key).await.unwrap().unwrap();
        assert_eq!(loaded.contract.chain_key, p.contract.chain_key);
    }

    #[tokio::test]
    async fn second_open_for_key_is_rejected_atomically() {
        let store = Store::in_memory().await.unwrap();
        let p = position(key("AAPL", Some(Right::Call)), 150.0, 1);
        store.record_open(&p, &ledger_open(&p)).await.unwrap();

        let again = position(p.key.clone(), 155.0, 2);
        let err = store.record_open(&again, &ledger_open(&again)).await.unwrap_err();
        assert!(matches!(err, TradeError::InvariantViolation { .. }));
        // the ledger insert rolled back with the position insert
        assert_eq!(store.ledger_rows("AAPL", "breakout").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn call_and_put_share_slot_when_key_ignores_right() {
        let store = Store::in_memory().await.unwrap();
        let call = position(key("NVDA", None), 450.0, 1);
        store.record_open(&call, &ledger_open(&call)).await.unwrap();

        let mut put = position(key("NVDA", None), 440.0, 1);
        put.contract = CandidateContract::new("NVDA", date("20240119"), 440.0, Right::Put);
        assert!(store.record_open(&put, &ledger_open(&put)).await.is_err());

        let keyed_put = position(key("NVDA", Some(Right::Put)), 440.0, 1);
        store.record_open(&keyed_put, &ledger_open(&keyed_put)).await.unwrap();
    }

    #[tokio::test]
    async fn close_settles_newest_pending_only() {
        let store = Store::in_memory().await.unwrap();
        let k = key("AMZN", Some(Right::Put));
        let first = position(k.clone(), 140.0, 1);
        store.record_open(&first, &ledger_open(&first)).await.unwrap();
        assert_eq!(store.record_close(&k, &close(Outcome::Loss)).await.unwrap(), 1);

        let second = position(k.clone(), 135.0, 2);
        store.record_open(&second, &ledger_open(&second)).await.unwrap();
        assert_eq!(store.record_close(&k, &close(Outcome::Win)).await.unwrap(), 1);

        let rows = store.ledger_rows("AMZN", "breakout").await.unwrap();
        let outcomes: Vec<&str> = rows.iter().map(|r| r.outcome.as_str()).collect();
        assert_eq!(outcomes, ["LOSS", "WIN"]);
        assert!(rows.iter().all(|r| r.closed_at.is_some() && r.sell_fill_price == Some(2.6)));
        assert!(store.load_position(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_without_pending_row_settles_nothing() {
        let store = Store::in_memory().await.unwrap();
        let k = key("AAPL", Some(Right::Call));
        assert_eq!(store.record_close(&k, &close(Outcome::Win)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ledger_selector_respects_right() {
        let store = Store::in_memory().await.unwrap();
        let call = position(key("TSLA", Some(Right::Call)), 250.0, 1);
        let put = position(key("TSLA", Some(Right::Put)), 240.0, 1);
        store.record_open(&call, &ledger_open(&call)).await.unwrap();
        store.record_open(&put, &ledger_open(&put)).await.unwrap();

        store.record_close(&call.key, &close(Outcome::Win)).await.unwrap();
        let rows = store.ledger_rows("TSLA", "breakout").await.unwrap();
        assert_eq!(rows[0].option_right, "CALL");
        assert_eq!(rows[0].outcome, "WIN");
        assert_eq!(rows[1].outcome, "PENDING");
    }

    #[tokio::test]
    async fn partial_close_updates_quantity() {
        let store = Store::in_memory().await.unwrap();
        let p = position(key("AAPL", Some(Right::Call)), 150.0, 5);
        store.record_open(&p, &ledger_open(&p)).await.unwrap();
        store.update_quantity(&p.key, 2).await.unwrap();
        assert_eq!(store.load_position(&p.key).await.unwrap().unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn summary_counts_by_outcome() {
        let store = Store::in_memory().await.unwrap();
        let start = Utc::now() - chrono::Duration::seconds(1);
        for (sym, outcome) in [("A", Some(Outcome::Win)), ("B", Some(Outcome::Loss)), ("C", None)] {
            let p = position(key(sym, Some(Right::Call)), 10.0, 1);
            store.record_open(&p, &ledger_open(&p)).await.unwrap();
            if let Some(o) = outcome {
                store.record_close(&p.key, &close(o)).await.unwrap();
            }
        }
        let s = store.outcome_summary(start).await.unwrap();
        assert_eq!(
            s,
            OutcomeSummary {
                wins: 1,
                losses: 1,
                pending: 1
            }
        );
    }

    #[tokio::test]
    async fn closed_pool_is_unavailable_until_reconnect() {
        let store = Store::in_memory().await.unwrap();
        store.close().await;
        assert!(matches!(store.ping().await, Err(TradeError::StoreUnavailable(_))));
        store.reconnect().await.unwrap();
        store.ping().await.unwrap();
        assert!(store.open_positions().await.unwrap().is_empty());
    }
}
