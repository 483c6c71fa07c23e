//! Black-Scholes greeks and implied volatility for quotes that arrive without them.

use chrono::{DateTime, NaiveDate, Utc};
use libm::erf;
use std::f64::consts::SQRT_2;

use crate::types::{Greeks, Right};

const SECONDS_PER_YEAR: f64 = 31_536_000.0;
const MIN_TAU_YEARS: f64 = 1.0 / SECONDS_PER_YEAR;
const MIN_VOL: f64 = 1e-4;
const MAX_VOL: f64 = 5.0;
const IV_TOLERANCE: f64 = 1e-4;
const IV_MAX_ITERS: usize = 50;
const INV_SQRT_TWO_PI: f64 = 0.3989422804014327;
const DAYS_PER_YEAR: f64 = 365.0;
/// US equity options stop trading at 16:00 ET; 20:00 UTC is close enough.
const EXPIRY_HOUR_UTC: u32 = 20;

struct BsResult {
    price: f64,
    delta: f64,
    gamma: f64,
    vega: f64,
    theta: f64,
}

/// Year fraction from `now` until the expiration close, floored at one second.
pub fn years_to_expiry(expiration: NaiveDate, now: DateTime<Utc>) -> f64 {
    let close = expiration
        .and_hms_opt(EXPIRY_HOUR_UTC, 0, 0)
        .map(|n| n.and_utc())
        .unwrap_or(now);
    let secs = (close - now).num_seconds() as f64;
    (secs / SECONDS_PER_YEAR).max(MIN_TAU_YEARS)
}

/// Solve IV from the option's market price and derive greeks from it.
/// Theta is per calendar day. Returns `None` when the price is below
/// intrinsic or the solver does not converge.
pub fn from_market_price(
    right: Right,
    spot: f64,
    strike: f64,
    rate: f64,
    tau: f64,
    option_price: f64,
) -> Option<Greeks> {
    let is_call = right == Right::Call;
    let vol = solve_implied_vol(option_price, is_call, spot, strike, rate, tau)?;
    let res = bs_price_and_greeks(is_call, spot, strike, rate, vol, tau)?;
    Some(Greeks {
        delta: res.delta,
        gamma: res.gamma,
        theta: res.theta / DAYS_PER_YEAR,
        implied_vol: vol,
    })
}

fn bs_price_and_greeks(
    is_call: bool,
    spot: f64,
    strike: f64,
    rate: f64,
    vol: f64,
    tau: f64,
) -> Option<BsResult> {
    if !(spot > 0.0 && strike > 0.0 && vol > 0.0 && tau > 0.0) {
        return None;
    }
    let sqrt_tau = tau.sqrt();
    let denom = vol * sqrt_tau;
    if !denom.is_finite() || denom <= 0.0 {
        return None;
    }
    let log_term = (spot / strike).ln();
    if !log_term.is_finite() {
        return None;
    }
    let d1 = (log_term + (rate + 0.5 * vol * vol) * tau) / denom;
    let d2 = d1 - denom;
    let disc_r = (-rate * tau).exp();
    let pdf_d1 = norm_pdf(d1);
    let gamma = pdf_d1 / (spot * denom);
    let vega = spot * pdf_d1 * sqrt_tau;
    if !gamma.is_finite() || !vega.is_finite() {
        return None;
    }
    let decay = -spot * pdf_d1 * vol / (2.0 * sqrt_tau);
    let (price, delta, theta) = if is_call {
        let nd1 = norm_cdf(d1);
        let nd2 = norm_cdf(d2);
        (
            spot * nd1 - strike * disc_r * nd2,
            nd1,
            decay - rate * strike * disc_r * nd2,
        )
    } else {
        let nneg_d1 = norm_cdf(-d1);
        let nneg_d2 = norm_cdf(-d2);
        (
            strike * disc_r * nneg_d2 - spot * nneg_d1,
            -nneg_d1,
            decay + rate * strike * disc_r * nneg_d2,
        )
    };
    Some(BsResult {
        price,
        delta,
        gamma,
        vega,
        theta,
    })
}

fn solve_implied_vol(
    target: f64,
    is_call: bool,
    spot: f64,
    strike: f64,
    rate: f64,
    tau: f64,
) -> Option<f64> {
    if !target.is_finite() || target <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return None;
    }
    let intrinsic = if is_call {
        (spot - strike).max(0.0)
    } else {
        (strike - spot).max(0.0)
    };
    if target < intrinsic - 1e-6 {
        return None;
    }
    let mut sigma = 0.3f64;
    for _ in 0..IV_MAX_ITERS {
        let res = bs_price_and_greeks(is_call, spot, strike, rate, sigma, tau)?;
        let diff = res.price - target;
        if diff.abs() < IV_TOLERANCE {
            return Some(sigma);
        }
        if res.vega.abs() < 1e-8 {
            break;
        }
        sigma -= diff / res.vega;
        if !sigma.is_finite() {
            break;
        }
        sigma = sigma.clamp(MIN_VOL, MAX_VOL);
    }
    None
}

fn norm_pdf(x: f64) -> f64 {
    INV_SQRT_TWO_PI * (-0.5 * x * x).exp()
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_volatility_from_its_own_price() {
        let tau = 30.0 / 365.0;
        let price = bs_price_and_greeks(true, 100.0, 105.0, 0.04, 0.35, tau)
            .unwrap()
            .price;
        let g = from_market_price(Right::Call, 100.0, 105.0, 0.04, tau, price).unwrap();
        assert!((g.implied_vol - 0.35).abs() < 1e-3, "iv {}", g.implied_vol);
        assert!(g.delta > 0.0 && g.delta < 0.5);
        assert!(g.gamma > 0.0);
        assert!(g.theta < 0.0);
    }

    #[test]
    fn put_delta_is_negative_and_parity_holds() {
        let tau = 0.25;
        let call = bs_price_and_greeks(true, 50.0, 50.0, 0.03, 0.2, tau).unwrap();
        let put = bs_price_and_greeks(false, 50.0, 50.0, 0.03, 0.2, tau).unwrap();
        assert!(put.delta < 0.0);
        assert!((call.delta - put.delta - 1.0).abs() < 1e-9);
        let parity = call.price - put.price - (50.0 - 50.0 * (-0.03f64 * tau).exp());
        assert!(parity.abs() < 1e-9);
    }

    #[test]
    fn below_intrinsic_has_no_solution() {
        assert!(from_market_price(Right::Call, 120.0, 100.0, 0.04, 0.1, 5.0).is_none());
        assert!(from_market_price(Right::Put, 100.0, 100.0, 0.04, 0.1, 0.0).is_none());
    }

    #[test]
    fn expiry_fraction_is_floored() {
        let exp = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        let before = NaiveDate::from_ymd_opt(2024, 1, 18)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap()
            .and_utc();
        assert!((years_to_expiry(exp, before) - 86_400.0 / SECONDS_PER_YEAR).abs() < 1e-12);
        let after = before + chrono::Duration::days(3);
        assert_eq!(years_to_expiry(exp, after), MIN_TAU_YEARS);
    }
}
