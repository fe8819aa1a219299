use crate::service::ServiceState;
use orderflow_analysis::AnalysisError;
use orderflow_data::error::DataError;
use thiserror::Error;

/// All errors generated in `orderflow-server`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid OrderFlowService state for operation: {0:?}")]
    InvalidState(ServiceState),

    #[error("data: {0}")]
    Data(#[from] DataError),

    #[error("analysis: {0}")]
    Analysis(#[from] AnalysisError),
}
