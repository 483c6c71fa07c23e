//! Load and validate runtime configuration.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordCfg {
    pub channel_ids: Vec<String>,
    pub tracked_users: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebullCfg {
    pub region: Option<i32>, // e.g., 6 for US
    pub mode: String,        // "paper" or "live"
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default = "default_order_timeout_sec")]
    pub order_timeout_sec: u64,
    /// Symbol used for the cheap liveness probe.
    #[serde(default = "default_probe_symbol")]
    pub probe_symbol: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RiskTier {
    /// Inclusive upper bound of the balance band; `None` is open-ended.
    pub up_to: Option<f64>,
    pub fraction: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskCfg {
    pub balance: f64,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<RiskTier>,
    /// Add one contract when |delta| is below this. `None` disables.
    #[serde(default = "default_low_delta_bump")]
    pub low_delta_bump: Option<f64>,
    pub max_position_value: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Skip the trade when nothing is in band.
    NoTrade,
    /// Pick the candidate whose |delta| is nearest to either band edge.
    ClosestToBand,
    /// Pick the candidate with the largest |delta|.
    MostInTheMoney,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SelectionCfg {
    #[serde(default = "default_strike_count")]
    pub strike_count: usize,
    /// Band on |delta|, exclusive on both ends. Puts are matched on the mirrored band.
    #[serde(default = "default_delta_lower")]
    pub delta_lower: f64,
    #[serde(default = "default_delta_upper")]
    pub delta_upper: f64,
    #[serde(default = "default_delta_target")]
    pub delta_target: f64,
    #[serde(default = "default_fallback")]
    pub fallback: FallbackPolicy,
    #[serde(default = "default_true")]
    pub skip_zero_day: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PositionsCfg {
    #[serde(default = "default_true")]
    pub key_includes_right: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecCfg {
    pub dry_run: bool,
    #[serde(default = "default_tif")]
    pub tif: String, // "DAY" or "GTC"
    #[serde(default)]
    pub buy_limit_slippage_pct: f64,
    #[serde(default)]
    pub sell_limit_slippage_pct: f64,
    #[serde(default = "default_venue_timeout_sec")]
    pub venue_timeout_sec: u64,
}

impl ExecCfg {
    pub fn venue_timeout(&self) -> Duration {
        Duration::from_secs(self.venue_timeout_sec)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreCfg {
    /// sqlx url, e.g. `sqlite://data/trader.db`. Defaults to the user data dir.
    pub url: Option<String>,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl StoreCfg {
    pub fn resolved_url(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let dirs = directories::ProjectDirs::from("", "", "signal-options-trader")
            .ok_or_else(|| anyhow::anyhow!("cannot resolve a home directory for the store"))?;
        let dir = dirs.data_dir();
        fs::create_dir_all(dir)?;
        Ok(format!("sqlite://{}", dir.join("trader.db").display()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorCfg {
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Reconnect attempts per check; 0 retries until it succeeds.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainCfg {
    pub underlyings: Vec<String>,
    #[serde(default = "default_refresh_interval_sec")]
    pub refresh_interval_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportCfg {
    #[serde(default = "default_summary_hour")]
    pub summary_hour: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub discord: DiscordCfg,
    pub webull: WebullCfg,
    pub risk: RiskCfg,
    #[serde(default)]
    pub selection: SelectionCfg,
    #[serde(default)]
    pub positions: PositionsCfg,
    pub exec: ExecCfg,
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub supervisor: SupervisorCfg,
    pub chain: ChainCfg,
    #[serde(default)]
    pub report: ReportCfg,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let sel = &self.selection;
        if !(0.0 <= sel.delta_lower && sel.delta_lower < sel.delta_upper && sel.delta_upper <= 1.0) {
            anyhow::bail!(
                "selection delta band must satisfy 0 <= lower < upper <= 1 (got {}..{})",
                sel.delta_lower,
                sel.delta_upper
            );
        }
        if sel.strike_count == 0 {
            anyhow::bail!("selection.strike_count must be at least 1");
        }
        if self.risk.tiers.is_empty() {
            anyhow::bail!("risk.tiers must not be empty");
        }
        if self.risk.tiers.iter().any(|t| !(0.0..=1.0).contains(&t.fraction)) {
            anyhow::bail!("risk tier fractions must be within 0..=1");
        }
        if self.exec.venue_timeout_sec <= self.webull.order_timeout_sec {
            anyhow::bail!(
                "exec.venue_timeout_sec ({}) must exceed webull.order_timeout_sec ({})",
                self.exec.venue_timeout_sec,
                self.webull.order_timeout_sec
            );
        }
        if self.supervisor.backoff_multiplier < 1.0 {
            anyhow::bail!("supervisor.backoff_multiplier must be >= 1");
        }
        Ok(())
    }
}

impl Default for SelectionCfg {
    fn default() -> Self {
        Self {
            strike_count: default_strike_count(),
            delta_lower: default_delta_lower(),
            delta_upper: default_delta_upper(),
            delta_target: default_delta_target(),
            fallback: default_fallback(),
            skip_zero_day: true,
        }
    }
}

impl Default for PositionsCfg {
    fn default() -> Self {
        Self {
            key_includes_right: true,
        }
    }
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            url: None,
            write_retries: default_write_retries(),
        }
    }
}

impl Default for SupervisorCfg {
    fn default() -> Self {
        Self {
            check_interval_sec: default_check_interval_sec(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ReportCfg {
    fn default() -> Self {
        Self {
            summary_hour: default_summary_hour(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_risk_free_rate() -> f64 {
    0.04
}
fn default_order_timeout_sec() -> u64 {
    30
}
fn default_probe_symbol() -> String {
    "SPY".to_string()
}
fn default_tiers() -> Vec<RiskTier> {
    vec![
        RiskTier {
            up_to: Some(1000.0),
            fraction: 0.05,
        },
        RiskTier {
            up_to: Some(3000.0),
            fraction: 0.02,
        },
        RiskTier {
            up_to: None,
            fraction: 0.01,
        },
    ]
}
fn default_low_delta_bump() -> Option<f64> {
    Some(0.35)
}
fn default_strike_count() -> usize {
    2
}
fn default_delta_lower() -> f64 {
    0.30
}
fn default_delta_upper() -> f64 {
    0.50
}
fn default_delta_target() -> f64 {
    0.45
}
fn default_fallback() -> FallbackPolicy {
    FallbackPolicy::ClosestToBand
}
fn default_tif() -> String {
    "DAY".to_string()
}
fn default_venue_timeout_sec() -> u64 {
    60
}
fn default_write_retries() -> u32 {
    3
}
fn default_check_interval_sec() -> u64 {
    60
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    5
}
fn default_refresh_interval_sec() -> u64 {
    3600
}
fn default_summary_hour() -> u32 {
    16
}
