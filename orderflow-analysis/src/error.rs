use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `orderflow-analysis`.
///
/// Aggregators return these synchronously and never partially mutate anything on failure.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum AnalysisError {
    #[error("no ticks provided for analysis")]
    EmptyTicks,

    #[error("unsupported tick aggregation method: {0}")]
    UnsupportedAggregation(String),

    #[error("invalid OrderFlowConfig: {0}")]
    InvalidConfig(String),
}
