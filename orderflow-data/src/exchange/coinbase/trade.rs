use crate::{
    error::DataError,
    exchange::ExchangeId,
    tick::{Side, Tick},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Messages received on the Coinbase `matches` channel.
///
/// Only `"match"` frames carry a trade that is normalised into a [`Tick`]. Snapshot style
/// `"last_match"` frames, `"subscriptions"` acknowledgements and heartbeats are ignored.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum CoinbaseMessage {
    #[serde(rename = "match")]
    Match(CoinbaseMatch),
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Ignore,
}

/// ### Raw Payload Examples
/// See docs: <https://docs.cdp.coinbase.com/exchange/docs/websocket-channels#match>
///```json
/// {
///     "type": "match",
///     "trade_id": 10,
///     "sequence": 50,
///     "maker_order_id": "ac928c66-ca53-498f-9c13-a110027a60e8",
///     "taker_order_id": "132fb6ae-456b-4654-b4e0-d681ac05cea1",
///     "time": "2014-11-07T08:19:27.028459Z",
///     "product_id": "BTC-USD",
///     "size": "5.23512",
///     "price": "400.23",
///     "side": "sell"
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CoinbaseMatch {
    pub trade_id: u64,
    pub sequence: u64,
    pub time: DateTime<Utc>,
    pub product_id: SmolStr,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub side: String,
}

impl TryFrom<CoinbaseMatch> for Tick {
    type Error = DataError;

    fn try_from(trade: CoinbaseMatch) -> Result<Self, Self::Error> {
        // Side is taken verbatim from the frame
        let side = match trade.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => {
                return Err(DataError::UnsupportedSide {
                    exchange: ExchangeId::Coinbase,
                    side: trade.side,
                });
            }
        };

        Ok(Self {
            id: format!("{}_{}", ExchangeId::Coinbase, trade.trade_id),
            symbol: trade.product_id,
            price: trade.price,
            volume: trade.size,
            side,
            exchange: ExchangeId::Coinbase,
            timestamp: trade.time,
            // Coinbase does not flag the aggressor on public matches
            is_aggressor: true,
            sequence: trade.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_coinbase_message() {
        struct TestCase {
            input: &'static str,
            expected: Option<CoinbaseMessage>,
        }

        let tests = vec![
            TestCase {
                // TC0: input CoinbaseMatch is deserialised
                input: r#"
                    {
                        "type": "match",
                        "trade_id": 10,
                        "sequence": 50,
                        "maker_order_id": "ac928c66-ca53-498f-9c13-a110027a60e8",
                        "taker_order_id": "132fb6ae-456b-4654-b4e0-d681ac05cea1",
                        "time": "2014-11-07T08:19:27.028459Z",
                        "product_id": "BTC-USD",
                        "size": "5.23512",
                        "price": "400.23",
                        "side": "sell"
                    }
                "#,
                expected: Some(CoinbaseMessage::Match(CoinbaseMatch {
                    trade_id: 10,
                    sequence: 50,
                    time: "2014-11-07T08:19:27.028459Z".parse().unwrap(),
                    product_id: SmolStr::new("BTC-USD"),
                    size: dec!(5.23512),
                    price: dec!(400.23),
                    side: "sell".to_string(),
                })),
            },
            TestCase {
                // TC1: input last_match snapshot is ignored
                input: r#"
                    {
                        "type": "last_match",
                        "trade_id": 9,
                        "sequence": 49,
                        "time": "2014-11-07T08:19:27.028459Z",
                        "product_id": "BTC-USD",
                        "size": "1",
                        "price": "400",
                        "side": "buy"
                    }
                "#,
                expected: Some(CoinbaseMessage::Ignore),
            },
            TestCase {
                // TC2: input subscriptions acknowledgement is ignored
                input: r#"{"type": "subscriptions", "channels": [{"name": "matches", "product_ids": ["BTC-USD"]}]}"#,
                expected: Some(CoinbaseMessage::Ignore),
            },
            TestCase {
                // TC3: input error frame is deserialised
                input: r#"{"type": "error", "message": "Failed to subscribe", "reason": "BTC-XYZ is not a valid product"}"#,
                expected: Some(CoinbaseMessage::Error {
                    message: "Failed to subscribe".to_string(),
                    reason: Some("BTC-XYZ is not a valid product".to_string()),
                }),
            },
            TestCase {
                // TC4: input match w/ invalid time fails
                input: r#"
                    {
                        "type": "match", "trade_id": 1, "sequence": 1, "time": "yesterday",
                        "product_id": "BTC-USD", "size": "1", "price": "1", "side": "buy"
                    }
                "#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<CoinbaseMessage>(test.input);
            match (actual, test.expected) {
                (Ok(actual), Some(expected)) => {
                    assert_eq!(actual, expected, "TC{} failed", index)
                }
                (Err(_), None) => {
                    // Test passed
                }
                (actual, expected) => {
                    // Test failed
                    panic!(
                        "TC{index} failed because actual != expected. \nActual: {actual:?}\nExpected: {expected:?}\n"
                    );
                }
            }
        }
    }

    #[test]
    fn test_coinbase_match_to_tick() {
        struct TestCase {
            side: &'static str,
            expected: Result<Side, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: buy side is kept verbatim
                side: "buy",
                expected: Ok(Side::Buy),
            },
            TestCase {
                // TC1: sell side is kept verbatim
                side: "sell",
                expected: Ok(Side::Sell),
            },
            TestCase {
                // TC2: unknown side is rejected
                side: "both",
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let trade = CoinbaseMatch {
                trade_id: 10,
                sequence: 50,
                time: "2014-11-07T08:19:27.028459Z".parse().unwrap(),
                product_id: SmolStr::new("BTC-USD"),
                size: dec!(5.23512),
                price: dec!(400.23),
                side: test.side.to_string(),
            };

            match (Tick::try_from(trade), test.expected) {
                (Ok(tick), Ok(side)) => {
                    assert_eq!(tick.side, side, "TC{} failed", index);
                    assert!(tick.is_aggressor, "TC{} failed", index);
                    assert_eq!(tick.id, "coinbase_10", "TC{} failed", index);
                    assert_eq!(tick.sequence, 50, "TC{} failed", index);
                    assert_eq!(tick.volume, dec!(5.23512), "TC{} failed", index);
                }
                (Err(DataError::UnsupportedSide { .. }), Err(())) => {}
                (actual, expected) => {
                    panic!("TC{index} failed. \nActual: {actual:?}\nExpected: {expected:?}\n");
                }
            }
        }
    }
}
