#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Orderflow-Data
//! Normalised multi-exchange trade tick ingestion.
//!
//! * Exchange [`Connector`](exchange::Connector)s for the Binance spot trade stream and the
//!   Coinbase Exchange `matches` channel, each normalising raw frames into a canonical
//!   [`Tick`](tick::Tick).
//! * A [`TickCache`](cache::TickCache) retaining recent ticks per symbol with a TTL and a
//!   capped most recent first list.
//! * A [`SubscriberHub`](subscriber::SubscriberHub) fanning ticks out to bounded per symbol
//!   queues, dropping rather than blocking when a consumer falls behind.
//! * The [`TickCollector`](collector::TickCollector) supervising one reconnecting connection
//!   per exchange.

/// Key-value [`TickCache`](cache::TickCache) abstraction and in memory implementation.
pub mod cache;

/// [`TickCollector`](collector::TickCollector) and its configuration.
pub mod collector;

/// All [`Error`](std::error::Error)s generated in `orderflow-data`.
pub mod error;

/// Exchange [`Connector`](exchange::Connector) implementations.
pub mod exchange;

/// Stream adaptors used by exchange connections.
pub mod streams;

/// Bounded drop-on-full subscriber fan-out.
pub mod subscriber;

/// Normalised [`Tick`](tick::Tick) trade model.
pub mod tick;

