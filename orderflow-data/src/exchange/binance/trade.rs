use crate::{
    exchange::ExchangeId,
    tick::{Side, Tick},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// Messages received on the Binance trade stream.
#[derive(Clone, Debug, PartialEq)]
pub enum BinanceMessage {
    Ignore,
    Trade(BinanceTrade),
}

impl<'de> Deserialize<'de> for BinanceMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut value = Value::deserialize(deserializer)?;

        // Combined stream frames wrap the event: {"stream": "btcusdt@trade", "data": {...}}
        if value.get("stream").is_some() {
            if let Some(data) = value.get_mut("data").map(Value::take) {
                value = data;
            }
        }

        match value.get("e").and_then(Value::as_str) {
            Some("trade") => serde_json::from_value::<BinanceTrade>(value)
                .map(BinanceMessage::Trade)
                .map_err(serde::de::Error::custom),
            Some(_) => Ok(BinanceMessage::Ignore),
            None if value.get("result").is_some() || value.get("id").is_some() => {
                Ok(BinanceMessage::Ignore)
            }
            None => Err(serde::de::Error::custom(
                "Binance frame is neither a trade event nor a subscription response",
            )),
        }
    }
}

/// ### Raw Payload Examples
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#trade-streams>
/// Spot Side::Sell Trade (buyer is maker)
///```json
/// {
///     "e": "trade",
///     "E": 1672515782136,
///     "s": "BTCUSDT",
///     "t": 12345,
///     "p": "16578.50",
///     "q": "0.001",
///     "b": 88,
///     "a": 50,
///     "T": 1672515782134,
///     "m": true,
///     "M": true
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceTrade {
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,

    #[serde(rename = "s")]
    pub symbol: SmolStr,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,

    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,

    #[serde(rename = "b", default)]
    pub buyer_order_id: Option<u64>,

    #[serde(rename = "a", default)]
    pub seller_order_id: Option<u64>,

    #[serde(rename = "T", with = "chrono::serde::ts_milliseconds")]
    pub trade_time: DateTime<Utc>,

    /// Is the buyer the market maker? If so, the aggressor was the seller.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl BinanceTrade {
    /// Binance reports the maker flag rather than the aggressor side: a maker buyer means the
    /// incoming taker sold.
    pub fn side(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

impl From<BinanceTrade> for Tick {
    fn from(trade: BinanceTrade) -> Self {
        Self {
            id: format!("{}_{}", ExchangeId::Binance, trade.trade_id),
            side: trade.side(),
            symbol: trade.symbol,
            price: trade.price,
            volume: trade.quantity,
            exchange: ExchangeId::Binance,
            timestamp: trade.trade_time,
            is_aggressor: !trade.buyer_is_maker,
            sequence: trade.trade_id,
        }
    }
}
