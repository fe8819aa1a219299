use crate::exchange::ExchangeId;
use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Aggressor side of an executed trade.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[display("BUY")]
    Buy,
    #[display("SELL")]
    Sell,
}

impl Side {
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

/// Normalised trade execution received from an exchange feed.
///
/// A `Tick` is immutable once produced by an exchange normaliser. Every analyser treats
/// the `side` as the aggressor direction, so `delta` style calculations are simply the
/// signed sum of [`Tick::signed_volume`].
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Tick {
    /// Exchange qualified identifier, eg/ `binance_12345`.
    pub id: String,
    /// Exchange native symbol, eg/ `BTCUSDT` or `BTC-USD`.
    pub symbol: SmolStr,
    pub price: Decimal,
    pub volume: Decimal,
    pub side: Side,
    pub exchange: ExchangeId,
    pub timestamp: DateTime<Utc>,
    /// True if this trade crossed the spread.
    pub is_aggressor: bool,
    /// Monotonically increasing per exchange feed, carried for gap detection.
    pub sequence: u64,
}

impl Tick {
    /// `+volume` for [`Side::Buy`], `-volume` for [`Side::Sell`].
    pub fn signed_volume(&self) -> Decimal {
        match self.side {
            Side::Buy => self.volume,
            Side::Sell => -self.volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(side: Side, volume: Decimal) -> Tick {
        Tick {
            id: "binance_1".to_string(),
            symbol: SmolStr::new_static("BTCUSDT"),
            price: dec!(100),
            volume,
            side,
            exchange: ExchangeId::Binance,
            timestamp: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap(),
            is_aggressor: true,
            sequence: 1,
        }
    }

    #[test]
    fn test_signed_volume() {
        assert_eq!(tick(Side::Buy, dec!(1.5)).signed_volume(), dec!(1.5));
        assert_eq!(tick(Side::Sell, dec!(1.5)).signed_volume(), dec!(-1.5));
    }

    #[test]
    fn test_side_serde() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), r#""BUY""#);
        assert_eq!(
            serde_json::from_str::<Side>(r#""SELL""#).unwrap(),
            Side::Sell
        );
        assert_eq!(Side::Sell.to_string(), "SELL");
    }

    #[test]
    fn test_tick_json_round_trips_through_cache_format() {
        let input = tick(Side::Sell, dec!(0.25));
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains(r#""side":"SELL""#));
        assert_eq!(serde_json::from_str::<Tick>(&json).unwrap(), input);
    }
}
