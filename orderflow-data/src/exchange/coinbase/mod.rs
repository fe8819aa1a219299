use self::trade::CoinbaseMessage;
use super::{Connector, ExchangeId, parse_url};
use crate::{error::DataError, tick::Tick};
use derive_more::Display;
use serde_json::json;
use smol_str::SmolStr;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

/// Public trade types for [`Coinbase`].
pub mod trade;

/// [`Coinbase`] Exchange websocket feed base url.
///
/// See docs: <https://docs.cdp.coinbase.com/exchange/docs/websocket-overview>
pub const BASE_URL_COINBASE: &str = "wss://ws-feed.exchange.coinbase.com";

/// [`Coinbase`] Exchange spot `matches` channel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
pub struct Coinbase;

impl Connector for Coinbase {
    const ID: ExchangeId = ExchangeId::Coinbase;

    fn url() -> Result<Url, DataError> {
        parse_url(Self::ID, BASE_URL_COINBASE)
    }

    fn requests(symbols: &[SmolStr]) -> Vec<WsMessage> {
        vec![WsMessage::text(
            json!({
                "type": "subscribe",
                "product_ids": symbols,
                "channels": ["matches"],
            })
            .to_string(),
        )]
    }

    fn normalise(payload: &str) -> Result<Option<Tick>, DataError> {
        match serde_json::from_str::<CoinbaseMessage>(payload) {
            Ok(CoinbaseMessage::Match(trade)) => Tick::try_from(trade).map(Some),
            Ok(CoinbaseMessage::Error { message, reason }) => Err(DataError::Socket(format!(
                "coinbase rejected request: {message} ({})",
                reason.unwrap_or_default()
            ))),
            Ok(CoinbaseMessage::Ignore) => Ok(None),
            Err(error) => Err(DataError::deserialise(error, payload)),
        }
    }
}
