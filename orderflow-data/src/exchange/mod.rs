use crate::{error::DataError, tick::Tick};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

/// `Binance` spot trade stream [`Connector`] and normalisation.
pub mod binance;

/// `Coinbase` Exchange `matches` channel [`Connector`] and normalisation.
pub mod coinbase;

/// Unique identifier for an exchange trade feed supported by the `TickCollector`.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeId {
    #[display("binance")]
    Binance,
    #[display("coinbase")]
    Coinbase,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Coinbase => "coinbase",
        }
    }
}

/// Defines the connection url, subscription payloads and message normalisation for an exchange
/// trade feed.
///
/// Each implementation is a zero-sized marker type; the `TickCollector` selects the
/// implementation once per configured exchange and drives it with a reconnecting
/// connection task.
pub trait Connector: Send + Sync + 'static {
    /// Unique identifier for the exchange.
    const ID: ExchangeId;

    /// Base WebSocket url of the exchange trade feed.
    fn url() -> Result<Url, DataError>;

    /// Messages sent after connecting that subscribe to the provided exchange native symbols.
    fn requests(symbols: &[SmolStr]) -> Vec<WsMessage>;

    /// Normalise one text frame into a [`Tick`].
    ///
    /// Returns `Ok(None)` for frames that are well formed but carry no trade (subscription
    /// acknowledgements, heartbeats, etc).
    fn normalise(payload: &str) -> Result<Option<Tick>, DataError>;
}

pub(crate) fn parse_url(exchange: ExchangeId, url: &str) -> Result<Url, DataError> {
    Url::parse(url).map_err(|error| DataError::UrlParse {
        exchange,
        error: error.to_string(),
    })
}
