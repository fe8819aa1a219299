use crate::exchange::ExchangeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// All errors generated in `orderflow-data`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("failed to initialise TickCollector due to empty subscriptions")]
    SubscriptionsEmpty,

    #[error("TickCollector has already been started")]
    AlreadyStarted,

    #[error("failed to parse {exchange} url: {error}")]
    UrlParse { exchange: ExchangeId, error: String },

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("failed to deserialise payload: {error}, payload: {payload}")]
    Deserialise { error: String, payload: String },

    #[error("unsupported {exchange} trade side: {side}")]
    UnsupportedSide { exchange: ExchangeId, side: String },

    #[error("CacheError: {0}")]
    Cache(String),
}

impl DataError {
    /// Determine if an error requires an exchange connection to re-initialise.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            DataError::Socket(error_msg) => {
                // Socket termination errors require reconnection
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("terminated")
                    || error_lower.contains("connection closed")
                    || error_lower.contains("closed connection")
                    || error_lower.contains("sendafterclosing")
                    || error_lower.contains("io error")
                    || error_lower.contains("timeout")
            }
            DataError::UrlParse { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn deserialise(error: serde_json::Error, payload: &str) -> Self {
        Self::Deserialise {
            error: error.to_string(),
            payload: payload.to_string(),
        }
    }
}

impl From<tungstenite::Error> for DataError {
    fn from(value: tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_is_terminal() {
        struct TestCase {
            input: DataError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: is not terminal w/ DataError::Deserialise
                input: DataError::Deserialise {
                    error: "expected value".to_string(),
                    payload: "{".to_string(),
                },
                expected: false,
            },
            TestCase {
                // TC1: is terminal w/ DataError::Socket from a closed connection
                input: DataError::from(tungstenite::Error::ConnectionClosed),
                expected: true,
            },
            TestCase {
                // TC2: is terminal w/ DataError::Socket containing "terminated"
                input: DataError::Socket("binance stream terminated".to_string()),
                expected: true,
            },
            TestCase {
                // TC3: is terminal w/ DataError::Socket from sending on a closed connection
                input: DataError::from(tungstenite::Error::AlreadyClosed),
                expected: true,
            },
            TestCase {
                // TC4: is terminal w/ DataError::Socket containing "timeout"
                input: DataError::Socket(
                    "WebSocket read timeout: no data received for 120 seconds".to_string(),
                ),
                expected: true,
            },
            TestCase {
                // TC5: is not terminal w/ DataError::Cache
                input: DataError::Cache("connection refused".to_string()),
                expected: false,
            },
            TestCase {
                // TC6: is not terminal w/ DataError::Socket w/o termination keywords
                input: DataError::Socket("unexpected binary frame".to_string()),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_terminal();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
