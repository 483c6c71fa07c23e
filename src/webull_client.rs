//! `Venue` implementation over `webull_unofficial`: login, option chains,
//! quotes with derived greeks, limit orders and holdings.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use webull_unofficial::{
    error::WebullError,
    models::{OrderAction, Quote, TimeInForce},
    WebullClient,
};

use crate::config::WebullCfg;
use crate::greeks;
use crate::types::{
    occ_symbol, CandidateContract, ChainSnapshot, ExecutionResult, FillStatus, HeldContract,
    OrderRequest, QuotedContract, Right, Side,
};
use crate::utils::{parse_expiration, sanitize_symbol};
use crate::venue::Venue;

const POLL_EVERY: Duration = Duration::from_millis(800);

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub trading_pin: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            username: std::env::var("WEBULL_USERNAME").context("WEBULL_USERNAME not set")?,
            password: std::env::var("WEBULL_PASSWORD").context("WEBULL_PASSWORD not set")?,
            trading_pin: std::env::var("WEBULL_TRADING_PIN").ok(), // live only
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OrderStatus {
    Working,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Unknown(String),
}

#[derive(Debug, Clone)]
struct OrderInfo {
    status: OrderStatus,
    filled_qty: f64,
    avg_fill_price: f64,
}

pub struct WebullVenue {
    client: RwLock<WebullClient>,
    creds: Credentials,
    region: Option<i32>,
    live: bool,
    tif: TimeInForce,
    risk_free_rate: f64,
    order_timeout: Duration,
    probe_symbol: String,
    /// OCC chain key -> option ticker id, filled from chain fetches.
    option_ids: StdRwLock<HashMap<String, i64>>,
    /// Underlying symbol -> ticker id.
    underlying_ids: StdRwLock<HashMap<String, i64>>,
}

impl WebullVenue {
    /// Log in, prompting for an MFA code on the terminal if Webull asks for one.
    pub async fn login(creds: Credentials, cfg: &WebullCfg, tif: TimeInForce) -> Result<Self> {
        let live = cfg.mode.eq_ignore_ascii_case("live");
        let client = new_session(&creds, cfg.region, live, true).await?;
        info!("Webull mode: {}", if live { "live" } else { "paper" });
        Ok(Self {
            client: RwLock::new(client),
            creds,
            region: cfg.region,
            live,
            tif,
            risk_free_rate: cfg.risk_free_rate,
            order_timeout: Duration::from_secs(cfg.order_timeout_sec),
            probe_symbol: cfg.probe_symbol.clone(),
            option_ids: StdRwLock::default(),
            underlying_ids: StdRwLock::default(),
        })
    }

    async fn underlying_id(&self, symbol: &str) -> Result<i64> {
        if let Some(id) = self
            .underlying_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
        {
            return Ok(*id);
        }
        let found = self.client.read().await.find_ticker(symbol).await?;
        let id = found.first().context("no ticker found")?.ticker_id;
        self.underlying_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), id);
        Ok(id)
    }

    fn cached_option_id(&self, chain_key: &str) -> Option<i64> {
        self.option_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain_key)
            .copied()
    }

    /// Option ticker id for a contract, refetching the chain once on a miss.
    async fn option_id(&self, contract: &CandidateContract) -> Result<i64> {
        if let Some(id) = self.cached_option_id(&contract.chain_key) {
            return Ok(id);
        }
        self.get_chain(&contract.symbol).await?;
        self.cached_option_id(&contract.chain_key)
            .with_context(|| format!("option contract {} not listed", contract.chain_key))
    }

    async fn mid_price(&self, ticker_id: i64) -> Result<f64> {
        let q: Quote = self.client.read().await.get_quotes(&ticker_id.to_string()).await?;
        if let (Some(bid), Some(ask)) = (q.bid, q.ask) {
            if ask > 0.0 && bid > 0.0 {
                return Ok((bid + ask) / 2.0);
            }
        }
        Ok(q.close)
    }

    async fn get_order_info(&self, order_id: &str) -> Result<OrderInfo> {
        // no single-order lookup; filter the order list locally
        let arr = self.client.read().await.get_orders(None).await?;
        let vv: Value = serde_json::to_value(arr)?;
        let v = vv
            .as_array()
            .and_then(|a| {
                a.iter()
                    .find(|it| order_id_of(it).as_deref() == Some(order_id))
                    .cloned()
            })
            .unwrap_or(Value::Null);

        let status_str = v
            .get("status")
            .or_else(|| v.get("orderStatus"))
            .and_then(|s| s.as_str())
            .unwrap_or("UNKNOWN");
        let status = match status_str.to_ascii_uppercase().as_str() {
            "WORKING" | "OPEN" | "PENDING" => OrderStatus::Working,
            "PARTIALLY_FILLED" | "PARTIAL" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Canceled,
            "REJECTED" | "FAILED" => OrderStatus::Rejected,
            other => OrderStatus::Unknown(other.to_string()),
        };
        let filled_qty = ["filledQuantity", "filledQty", "filled_quantity"]
            .iter()
            .find_map(|k| v.get(*k).and_then(json_f64))
            .unwrap_or(0.0);
        let avg_fill_price = ["filledAvgPrice", "avgFillPrice", "avg_fill_price"]
            .iter()
            .find_map(|k| v.get(*k).and_then(json_f64))
            .unwrap_or(0.0);

        Ok(OrderInfo {
            status,
            filled_qty,
            avg_fill_price,
        })
    }

    async fn poll_until_settled(&self, order_id: &str) -> Result<OrderInfo> {
        let start = Instant::now();
        loop {
            let info = self.get_order_info(order_id).await?;
            match info.status {
                OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected => {
                    return Ok(info)
                }
                OrderStatus::PartiallyFilled | OrderStatus::Working | OrderStatus::Unknown(_) => {}
            }
            if start.elapsed() >= self.order_timeout {
                return Ok(info);
            }
            tokio::time::sleep(POLL_EVERY).await;
        }
    }
}

async fn new_session(
    creds: &Credentials,
    region: Option<i32>,
    live: bool,
    interactive: bool,
) -> Result<WebullClient> {
    let mut client = if live {
        WebullClient::new_live(region).context("create live client")?
    } else {
        WebullClient::new_paper(region).context("create paper client")?
    };
    info!(
        "Webull login attempt: user(partial)={}, live={}, region={:?}",
        mask_user(&creds.username),
        live,
        region
    );

    // trusted device/IP usually skips MFA
    let first = client
        .login_with()
        .username(&creds.username)
        .password(&creds.password)
        .await;
    let need_mfa = match first {
        Ok(_) => false,
        Err(WebullError::MfaRequired) => true,
        // some regions report MFA as a generic auth error
        Err(WebullError::AuthenticationError(_)) => {
            error!("AuthenticationError on first attempt; trying MFA.");
            true
        }
        Err(e) => {
            error!("Webull login error: {:#?}", e);
            return Err(e).context("webull login failed");
        }
    };

    if need_mfa {
        if !interactive {
            bail!("Webull wants an MFA code; restart interactively to log in again");
        }
        let code = prompt_mfa("Enter the 6-digit Webull verification code: ").await?;
        client
            .login_with()
            .username(&creds.username)
            .password(&creds.password)
            .mfa(code.trim())
            .await
            .context("webull login (with MFA) failed")?;
    }
    info!("Webull login success.");

    if live {
        let pin = creds
            .trading_pin
            .as_deref()
            .context("WEBULL_TRADING_PIN required for live")?;
        client
            .get_trade_token(pin)
            .await
            .context("get_trade_token failed")?;
        info!("Trade token acquired for live trading.");
    }
    Ok(client)
}

#[async_trait(?Send)]
impl Venue for WebullVenue {
    async fn get_chain(&self, underlying: &str) -> Result<ChainSnapshot> {
        let symbol = sanitize_symbol(underlying);
        let listed = self.client.read().await.get_options(&symbol).await?;

        let mut strikes = Vec::with_capacity(listed.len());
        let mut expirations = Vec::new();
        let mut ids = HashMap::with_capacity(listed.len());
        for c in listed {
            let (Some(right), Some(exp)) = (
                Right::from_code(&c.option_type),
                parse_expiration(&c.expiration_date),
            ) else {
                debug!(symbol = %symbol, raw = %c.expiration_date, "skipping unparseable contract");
                continue;
            };
            strikes.push(c.strike_price);
            expirations.push(exp);
            ids.insert(occ_symbol(&symbol, exp, c.strike_price, right), c.ticker_id);
        }
        self.option_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(ids);
        Ok(ChainSnapshot::new(&symbol, strikes, expirations, Utc::now()))
    }

    async fn quote(&self, contracts: &[CandidateContract]) -> Result<Vec<QuotedContract>> {
        let Some(first) = contracts.first() else {
            return Ok(Vec::new());
        };
        let spot = self.mid_price(self.underlying_id(&first.symbol).await?).await?;
        let now = Utc::now();

        let mut out = Vec::with_capacity(contracts.len());
        for c in contracts {
            let id = match self.option_id(c).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("skip quote for {}: {e:#}", c.display_name());
                    continue;
                }
            };
            let q: Quote = self.client.read().await.get_quotes(&id.to_string()).await?;
            let quoted = QuotedContract {
                contract: c.clone(),
                bid: q.bid.filter(|b| *b > 0.0),
                ask: q.ask.filter(|a| *a > 0.0),
                greeks: None,
            };
            let greeks = quoted.mid().and_then(|px| {
                greeks::from_market_price(
                    c.right,
                    spot,
                    c.strike,
                    self.risk_free_rate,
                    greeks::years_to_expiry(c.expiration, now),
                    px,
                )
            });
            out.push(QuotedContract { greeks, ..quoted });
        }
        Ok(out)
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<ExecutionResult> {
        let tid = self.option_id(&order.contract).await?;
        let action = match order.side {
            Side::Buy => OrderAction::Buy,
            Side::Sell => OrderAction::Sell,
        };
        let order_id = self
            .client
            .read()
            .await
            .place_limit_order_with(order.limit_price)
            .ticker_id(tid)
            .quantity(order.quantity as f64)
            .action(action)
            .time_in_force(self.tif.clone())
            .await?;
        info!(
            order_id,
            "placed {:?} {}x {} @ {:.2}",
            order.side,
            order.quantity,
            order.contract.display_name(),
            order.limit_price
        );

        let mut info = self.poll_until_settled(&order_id).await?;
        let settled = matches!(
            info.status,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        );
        if !settled {
            if let Err(e) = self.client.read().await.cancel_order(&order_id).await {
                warn!(order_id, "cancel after timeout failed: {e:#}");
            }
            info!(order_id, "order timed out -> canceled remainder");
            // fills can land between the last poll and the cancel
            if let Ok(last) = self.get_order_info(&order_id).await {
                info = last;
            }
        }

        let filled_qty = (info.filled_qty.max(0.0).floor() as u32).min(order.quantity);
        let status = match (&info.status, filled_qty) {
            (OrderStatus::Rejected, 0) => FillStatus::Rejected("rejected by Webull".into()),
            (_, 0) => FillStatus::Unfilled,
            (_, n) if n >= order.quantity => FillStatus::Filled,
            _ => FillStatus::PartiallyFilled,
        };
        Ok(ExecutionResult {
            order_id,
            status,
            filled_qty,
            avg_fill_price: info.avg_fill_price,
        })
    }

    async fn is_connected(&self) -> bool {
        match self.client.read().await.find_ticker(&self.probe_symbol).await {
            Ok(found) => !found.is_empty(),
            Err(e) => {
                debug!("Webull probe failed: {e:#?}");
                false
            }
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = new_session(&self.creds, self.region, self.live, false).await?;
        *self.client.write().await = fresh;
        Ok(())
    }

    async fn open_contracts(&self) -> Result<Vec<HeldContract>> {
        let raw_positions = self.client.read().await.get_positions().await?;
        let v: Value = serde_json::to_value(raw_positions)?;
        let Some(arr) = v.as_array() else {
            return Err(anyhow!("unexpected positions payload"));
        };
        Ok(arr.iter().filter_map(held_option).collect())
    }
}

/// Option holding from one Webull position entry; stock rows yield `None`.
fn held_option(it: &Value) -> Option<HeldContract> {
    let ticker = it.get("ticker");
    let is_option = it.get("assetType").and_then(Value::as_str) == Some("OPTION")
        || it.get("strikePrice").is_some()
        || it.get("optionType").is_some();
    if !is_option {
        return None;
    }
    let symbol = it
        .get("underlyingSymbol")
        .or_else(|| ticker.and_then(|t| t.get("symbol")))
        .or_else(|| it.get("symbol"))
        .and_then(Value::as_str)?;
    let strike = it
        .get("strikePrice")
        .or_else(|| it.get("strike"))
        .and_then(json_f64)?;
    let right = it
        .get("optionType")
        .or_else(|| it.get("callOrPut"))
        .or_else(|| it.get("putCall"))
        .and_then(Value::as_str)
        .and_then(Right::from_code)?;
    let expiration = it
        .get("expireDate")
        .or_else(|| it.get("expirationDate"))
        .and_then(Value::as_str)
        .and_then(parse_expiration);
    let quantity = it.get("position").and_then(json_f64).unwrap_or(0.0);
    Some(HeldContract {
        symbol: sanitize_symbol(symbol),
        strike,
        right,
        expiration,
        quantity: quantity.max(0.0) as u32,
    })
}

fn order_id_of(it: &Value) -> Option<String> {
    ["orderId", "order_id", "orderIdStr"]
        .iter()
        .find_map(|k| match it.get(*k)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Webull mixes numbers and numeric strings.
fn json_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Prompt MFA code from CLI using a blocking read on a dedicated blocking thread.
async fn prompt_mfa(prompt: &str) -> Result<String> {
    use std::io::{self, Write};
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        print!("{}", prompt);
        let _ = io::stdout().flush();
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        let s = buf.trim().to_string();
        if s.is_empty() {
            return Err(anyhow!("Empty MFA code"));
        }
        Ok(s)
    })
    .await
    .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
}

/// Print first two chars, then mask the rest (for logs only).
fn mask_user(u: &str) -> String {
    let mut cs = u.chars();
    let a = cs.next().unwrap_or('*');
    let b = cs.next().unwrap_or('*');
    format!("{}{}****", a, b)
}
