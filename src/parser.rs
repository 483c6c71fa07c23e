//! Parse trade signals from intake payloads.
//! Shape: `{symbol, order:{condition, price, stoploss, takeProfit, right, action, result, contracts?, afterhours?}}`.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TradeError;
use crate::types::{Action, Outcome, Right, Signal};
use crate::utils::sanitize_symbol;

#[derive(Debug, Deserialize)]
struct RawSignal {
    symbol: String,
    order: RawOrder,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    condition: String,
    price: Value,
    #[serde(default, alias = "stopLoss")]
    stoploss: Value,
    #[serde(default, alias = "takeprofit")]
    take_profit: Value,
    right: String,
    action: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    contracts: Value,
    #[serde(default)]
    afterhours: Value,
}

/// Pull the JSON object out of a chat message. Handles bare payloads and
/// payloads fenced in a code block.
pub fn extract_payload(message: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("static regex"));
    re.find(message).map(|m| m.as_str())
}

pub fn parse_signal(text: &str) -> Result<Signal, TradeError> {
    let payload = extract_payload(text)
        .ok_or_else(|| TradeError::SignalParse("no JSON object in payload".into()))?;
    let raw: RawSignal =
        serde_json::from_str(payload).map_err(|e| TradeError::SignalParse(e.to_string()))?;

    let symbol = sanitize_symbol(&raw.symbol);
    if symbol.is_empty() {
        return Err(TradeError::SignalParse("empty symbol".into()));
    }
    let condition = raw.order.condition.trim().to_string();
    if condition.is_empty() {
        return Err(TradeError::SignalParse("empty condition".into()));
    }
    let right = Right::from_code(&raw.order.right)
        .ok_or_else(|| TradeError::SignalParse(format!("unknown right `{}`", raw.order.right)))?;
    let action = match raw.order.action.trim().to_ascii_uppercase().as_str() {
        "BUY" => Action::Buy,
        "SELL" => Action::Sell,
        other => return Err(TradeError::SignalParse(format!("unknown action `{other}`"))),
    };
    let entry_price = number(&raw.order.price)
        .filter(|p| *p > 0.0)
        .ok_or_else(|| TradeError::SignalParse("price must be a positive number".into()))?;
    let outcome = match raw.order.result.as_deref() {
        None => Outcome::Pending,
        Some(r) => Outcome::from_code(r)
            .ok_or_else(|| TradeError::SignalParse(format!("unknown result `{r}`")))?,
    };

    Ok(Signal {
        symbol,
        condition,
        right,
        action,
        entry_price,
        stop_loss: number(&raw.order.stoploss),
        take_profit: number(&raw.order.take_profit),
        outcome,
        contracts: number(&raw.order.contracts)
            .filter(|c| *c >= 0.0)
            .map(|c| c as u32),
        afterhours: flag(&raw.order.afterhours),
    })
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|x: &f64| x.is_finite())
}

fn flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_parse(s: &str) -> Signal {
        parse_signal(s).unwrap_or_else(|e| panic!("should parse: {s}: {e}"))
    }

    #[test]
    fn tradingview_buy_call() {
        let s = must_parse(
            r#"{"symbol":"amzn","order":{"condition":"breakout","price":141.52,"stoploss":139.9,
               "takeProfit":"144.1","right":"CALL","action":"BUY","result":"P","contracts":1,"afterhours":false}}"#,
        );
        assert_eq!(s.symbol, "AMZN");
        assert_eq!(s.condition, "breakout");
        assert_eq!(s.right, Right::Call);
        assert_eq!(s.action, Action::Buy);
        assert_eq!(s.entry_price, 141.52);
        assert_eq!(s.stop_loss, Some(139.9));
        assert_eq!(s.take_profit, Some(144.1));
        assert_eq!(s.outcome, Outcome::Pending);
        assert_eq!(s.contracts, Some(1));
        assert!(!s.afterhours);
    }

    #[test]
    fn sell_put_with_word_result_and_missing_optionals() {
        let s = must_parse(
            r#"{"symbol":"NVDA","order":{"condition":"sma","price":"455","right":"p","action":"sell","result":"WIN"}}"#,
        );
        assert_eq!(s.right, Right::Put);
        assert_eq!(s.action, Action::Sell);
        assert_eq!(s.outcome, Outcome::Win);
        assert_eq!(s.stop_loss, None);
        assert_eq!(s.take_profit, None);
        assert_eq!(s.contracts, None);
    }

    #[test]
    fn fenced_discord_message() {
        let msg = "alert!\n```json\n{\"symbol\":\"AAPL\",\"order\":{\"condition\":\"sma\",\"price\":190,\"right\":\"C\",\"action\":\"BUY\",\"result\":\"P\",\"afterhours\":\"true\"}}\n```";
        let s = must_parse(msg);
        assert_eq!(s.symbol, "AAPL");
        assert!(s.afterhours);
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_signal(r#"{"symbol":"AAPL","order":{"#).unwrap_err();
        assert!(matches!(err, TradeError::SignalParse(_)));
    }

    #[test]
    fn no_json_is_parse_error() {
        assert!(matches!(
            parse_signal("BTO 10 AAPL 150C 08/16 @ 2.50"),
            Err(TradeError::SignalParse(_))
        ));
    }

    #[test]
    fn unknown_action_and_right_rejected() {
        assert!(parse_signal(
            r#"{"symbol":"AAPL","order":{"condition":"x","price":1,"right":"CALL","action":"HOLD"}}"#
        )
        .is_err());
        assert!(parse_signal(
            r#"{"symbol":"AAPL","order":{"condition":"x","price":1,"right":"STRADDLE","action":"BUY"}}"#
        )
        .is_err());
    }

    #[test]
    fn non_positive_price_rejected() {
        assert!(parse_signal(
            r#"{"symbol":"AAPL","order":{"condition":"x","price":0,"right":"CALL","action":"BUY"}}"#
        )
        .is_err());
    }
}
