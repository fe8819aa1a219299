#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]

//! # Orderflow-Server
//! Live order flow service built on `orderflow-data` and `orderflow-analysis`.
//!
//! An [`OrderFlowService`] drives a [`TickCollector`](orderflow_data::collector::TickCollector),
//! keeps per symbol live metrics and periodically publishes footprint, delta and imbalance
//! results to per symbol subscribers. Historical queries read the collector's retained ticks.

/// All [`Error`](std::error::Error)s generated in `orderflow-server`.
pub mod error;

/// Query results and published order flow messages.
pub mod model;

/// [`OrderFlowService`] lifecycle, periodic loops and queries.
pub mod service;

pub use error::ServiceError;
pub use model::{OrderFlowMessage, OrderFlowMetrics, OrderFlowUpdate};
pub use service::{OrderFlowService, ServiceConfig, ServiceState};
