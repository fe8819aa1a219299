#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, type_alias_bounds)]

//! # Orderflow-Analysis
//! Synchronous order flow analytics over normalised [`Tick`](orderflow_data::tick::Tick)s.
//!
//! Every analyser operates on a private timestamp sorted copy of its input, so results do
//! not depend on the order ticks were collected in and repeated calls are idempotent.
//!
//! * [`FootprintEngine`] buckets ticks by time, volume or tick count into per price level
//!   [`FootprintBar`]s.
//! * [`VolumeProfiler`] distributes volume across price levels and derives the point of
//!   control, value area and high/low volume nodes.
//! * [`DeltaAnalyzer`] measures cumulative delta, momentum and buy/sell pressure.
//! * [`ImbalanceDetector`] finds stacked, absorbed and divergent order flow.

/// Price rounding and volume helpers shared by every analyser.
pub mod aggregation;

/// [`OrderFlowConfig`] analysis parameters.
pub mod config;

/// Cumulative delta analysis.
pub mod delta;

/// All [`Error`](std::error::Error)s generated in `orderflow-analysis`.
pub mod error;

/// Footprint chart aggregation.
pub mod footprint;

/// Order flow imbalance detection.
pub mod imbalance;

/// Volume profile aggregation.
pub mod volume_profile;

pub use config::{AggregationMethod, OrderFlowConfig};
pub use delta::{DeltaAnalyzer, DeltaProfile, DeltaSignal, DeltaThresholds};
pub use error::AnalysisError;
pub use footprint::{FootprintBar, FootprintEngine};
pub use imbalance::{ImbalanceDetector, OrderFlowImbalance};
pub use volume_profile::{TradingSession, VolumeProfile, VolumeProfileLevel, VolumeProfiler};
