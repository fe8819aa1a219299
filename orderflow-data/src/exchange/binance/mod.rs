use self::trade::BinanceMessage;
use super::{Connector, ExchangeId, parse_url};
use crate::{error::DataError, tick::Tick};
use derive_more::Display;
use serde_json::json;
use smol_str::SmolStr;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

/// Public trade types for [`Binance`].
pub mod trade;

/// [`Binance`] spot server base url.
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams>
pub const BASE_URL_BINANCE_SPOT: &str = "wss://stream.binance.com:9443/ws";

/// [`Binance`] spot exchange.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
pub struct Binance;

impl Connector for Binance {
    const ID: ExchangeId = ExchangeId::Binance;

    fn url() -> Result<Url, DataError> {
        parse_url(Self::ID, BASE_URL_BINANCE_SPOT)
    }

    fn requests(symbols: &[SmolStr]) -> Vec<WsMessage> {
        let params = symbols
            .iter()
            .map(|symbol| format!("{}@trade", symbol.to_lowercase()))
            .collect::<Vec<_>>();

        vec![WsMessage::text(
            json!({
                "method": "SUBSCRIBE",
                "params": params,
                "id": 1,
            })
            .to_string(),
        )]
    }

    fn normalise(payload: &str) -> Result<Option<Tick>, DataError> {
        match serde_json::from_str::<BinanceMessage>(payload) {
            Ok(BinanceMessage::Trade(trade)) => Ok(Some(Tick::from(trade))),
            Ok(BinanceMessage::Ignore) => Ok(None),
            Err(error) => Err(DataError::deserialise(error, payload)),
        }
    }
}
