use crate::{
    cache::{InMemoryTickCache, TickCache},
    error::DataError,
    exchange::{Connector, ExchangeId, binance::Binance, coinbase::Coinbase},
    streams::timeout::{DEFAULT_WS_READ_TIMEOUT, IdleTimeout},
    subscriber::{DEFAULT_SUBSCRIBER_CAPACITY, SubscriberHub, Subscription},
    tick::Tick,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Exchange native symbols to subscribe to on one exchange.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct ExchangeSubscription {
    pub exchange: ExchangeId,
    pub symbols: Vec<SmolStr>,
    /// Overrides the exchange's public feed url, eg/ for a testnet or relay.
    #[serde(default)]
    pub url: Option<Url>,
}

impl ExchangeSubscription {
    pub fn new<I, S>(exchange: ExchangeId, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        Self {
            exchange,
            symbols: symbols.into_iter().map(Into::into).collect(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }
}

/// [`TickCollector`] configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Exchanges and symbols to collect ticks for
    pub subscriptions: Vec<ExchangeSubscription>,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Reconnect if nothing is received for this long
    pub read_timeout: Duration,
    /// Capacity of each tick subscriber queue
    pub channel_buffer_size: usize,
    /// How often collector statistics are logged
    pub stats_interval: Duration,
    /// Cache expiry of stored ticks
    pub tick_retention: Duration,
    /// Depth of the per symbol most recent ticks list
    pub max_ticks_per_symbol: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            subscriptions: vec![
                ExchangeSubscription::new(ExchangeId::Binance, ["BTCUSDT", "ETHUSDT"]),
                ExchangeSubscription::new(ExchangeId::Coinbase, ["BTC-USD", "ETH-USD"]),
            ],
            reconnect_delay: Duration::from_secs(5),
            read_timeout: DEFAULT_WS_READ_TIMEOUT,
            channel_buffer_size: DEFAULT_SUBSCRIBER_CAPACITY,
            stats_interval: Duration::from_secs(60),
            tick_retention: Duration::from_secs(24 * 60 * 60),
            max_ticks_per_symbol: 10_000,
        }
    }
}

impl CollectorConfig {
    pub fn new(subscriptions: Vec<ExchangeSubscription>) -> Self {
        Self {
            subscriptions,
            ..Default::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_tick_retention(mut self, retention: Duration) -> Self {
        self.tick_retention = retention;
        self
    }

    pub fn with_max_ticks_per_symbol(mut self, max: usize) -> Self {
        self.max_ticks_per_symbol = max;
        self
    }

    /// Every configured symbol across all exchanges, in configuration order.
    pub fn symbols(&self) -> Vec<SmolStr> {
        self.subscriptions
            .iter()
            .flat_map(|subscription| subscription.symbols.iter().cloned())
            .collect()
    }
}

/// Lifecycle of a [`TickCollector`]. A stopped collector cannot be restarted.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub enum CollectorState {
    Created,
    Started,
    Stopped,
}

/// Snapshot of [`TickCollector`] counters.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize)]
pub struct CollectorStats {
    pub messages_received: u64,
    pub ticks_processed: u64,
    pub parse_errors: u64,
    pub ticks_stored: u64,
    pub cache_errors: u64,
    pub ticks_dropped: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: AtomicU64,
    ticks_processed: AtomicU64,
    parse_errors: AtomicU64,
    ticks_stored: AtomicU64,
    cache_errors: AtomicU64,
    reconnects: AtomicU64,
}

fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Lifecycle {
    state: CollectorState,
    stop: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: CollectorConfig,
    cache: Arc<dyn TickCache>,
    hub: SubscriberHub<Tick>,
    counters: Counters,
    lifecycle: RwLock<Lifecycle>,
}

/// Maintains one reconnecting connection per configured exchange, normalises trades into
/// [`Tick`]s, retains them in a [`TickCache`] and fans them out to per symbol subscribers.
///
/// Cloning is cheap and every clone drives the same collector.
#[derive(Clone)]
pub struct TickCollector {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TickCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickCollector")
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Cache key of a stored tick: `tick:{symbol}:{unix_nanos}:{id}`.
pub fn tick_key(tick: &Tick) -> String {
    let nanos = tick
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| tick.timestamp.timestamp_micros().saturating_mul(1_000));
    format!("tick:{}:{}:{}", tick.symbol, nanos, tick.id)
}

/// Cache key of the per symbol most recent first list of tick keys.
pub fn ticks_list_key(symbol: &str) -> String {
    format!("ticks:{symbol}")
}

impl TickCollector {
    /// Construct a collector backed by the provided [`TickCache`].
    pub fn new(config: CollectorConfig, cache: Arc<dyn TickCache>) -> Result<Self, DataError> {
        if config
            .subscriptions
            .iter()
            .all(|subscription| subscription.symbols.is_empty())
        {
            return Err(DataError::SubscriptionsEmpty);
        }

        let hub = SubscriberHub::new(config.channel_buffer_size);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                cache,
                hub,
                counters: Counters::default(),
                lifecycle: RwLock::new(Lifecycle {
                    state: CollectorState::Created,
                    stop: None,
                    tasks: Vec::new(),
                }),
            }),
        })
    }

    /// Construct a collector backed by an [`InMemoryTickCache`].
    pub fn in_memory(config: CollectorConfig) -> Result<Self, DataError> {
        Self::new(config, Arc::new(InMemoryTickCache::new()))
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.shared.config
    }

    pub fn state(&self) -> CollectorState {
        self.shared.lifecycle.read().state
    }

    /// Spawn one connection task per configured exchange plus the statistics task.
    ///
    /// The collector stops when either [`TickCollector::stop`] is called or `cancel` is
    /// cancelled.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), DataError> {
        let mut lifecycle = self.shared.lifecycle.write();
        if lifecycle.state != CollectorState::Created {
            return Err(DataError::AlreadyStarted);
        }

        // Resolve every url before spawning so a failure leaves nothing running
        let connections = self
            .shared
            .config
            .subscriptions
            .iter()
            .filter(|subscription| !subscription.symbols.is_empty())
            .map(|subscription| {
                let url = match (&subscription.url, subscription.exchange) {
                    (Some(url), _) => url.clone(),
                    (None, ExchangeId::Binance) => Binance::url()?,
                    (None, ExchangeId::Coinbase) => Coinbase::url()?,
                };
                Ok((subscription.exchange, url, subscription.symbols.clone()))
            })
            .collect::<Result<Vec<_>, DataError>>()?;

        let stop = cancel.child_token();
        let mut tasks = Vec::with_capacity(connections.len() + 1);

        for (exchange, url, symbols) in connections {
            let shared = Arc::clone(&self.shared);
            let task_stop = stop.clone();

            let task = match exchange {
                ExchangeId::Binance => {
                    tokio::spawn(run_connection::<Binance>(shared, url, symbols, task_stop))
                }
                ExchangeId::Coinbase => {
                    tokio::spawn(run_connection::<Coinbase>(shared, url, symbols, task_stop))
                }
            };
            tasks.push(task);
        }

        tasks.push(tokio::spawn(run_stats(
            Arc::clone(&self.shared),
            stop.clone(),
        )));

        info!(
            exchanges = tasks.len() - 1,
            symbols = ?self.shared.config.symbols(),
            "TickCollector started"
        );

        lifecycle.state = CollectorState::Started;
        lifecycle.stop = Some(stop);
        lifecycle.tasks = tasks;
        Ok(())
    }

    /// Signal every task to exit, wait for them and close all subscriber queues.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let (stop, tasks) = {
            let mut lifecycle = self.shared.lifecycle.write();
            if lifecycle.state == CollectorState::Stopped {
                return;
            }
            lifecycle.state = CollectorState::Stopped;
            (
                lifecycle.stop.take(),
                std::mem::take(&mut lifecycle.tasks),
            )
        };

        if let Some(stop) = stop {
            stop.cancel();
        }

        for task in tasks {
            if let Err(error) = task.await {
                error!(%error, "TickCollector task panicked");
            }
        }

        self.shared.hub.clear();
        info!(stats = ?self.stats(), "TickCollector stopped");
    }

    /// True if started, not stopped and not cancelled by the parent token.
    pub fn is_healthy(&self) -> bool {
        let lifecycle = self.shared.lifecycle.read();
        lifecycle.state == CollectorState::Started
            && lifecycle
                .stop
                .as_ref()
                .is_some_and(|stop| !stop.is_cancelled())
    }

    /// Register a bounded queue receiving every [`Tick`] for `symbol`.
    pub fn subscribe_to_ticks(&self, symbol: impl Into<SmolStr>) -> Subscription<Tick> {
        self.shared.hub.subscribe(symbol)
    }

    /// Remove and close the queue paired with `subscription`.
    pub fn unsubscribe_from_ticks(&self, subscription: &Subscription<Tick>) -> bool {
        self.shared.hub.unsubscribe(subscription)
    }

    /// Store then broadcast a normalised [`Tick`].
    ///
    /// Cache failures are counted and logged but never prevent the broadcast.
    pub async fn process_tick(&self, tick: Tick) {
        self.shared.process_tick(tick).await
    }

    /// Retained ticks for `symbol` with `start <= timestamp <= end`, oldest first.
    pub async fn recent_ticks(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, DataError> {
        let cache = &self.shared.cache;
        let keys = cache.lrange(&ticks_list_key(symbol), 0, -1).await?;

        let mut ticks = Vec::with_capacity(keys.len());
        // List is most recent first
        for key in keys.iter().rev() {
            let Some(value) = cache.get(key).await? else {
                continue;
            };

            match serde_json::from_str::<Tick>(&value) {
                Ok(tick) if tick.timestamp >= start && tick.timestamp <= end => ticks.push(tick),
                Ok(_) => {}
                Err(error) => {
                    warn!(%symbol, %key, %error, "failed to deserialise cached tick");
                }
            }
        }

        Ok(ticks)
    }

    pub fn stats(&self) -> CollectorStats {
        self.shared.stats()
    }
}

impl Shared {
    fn stats(&self) -> CollectorStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CollectorStats {
            messages_received: load(&self.counters.messages_received),
            ticks_processed: load(&self.counters.ticks_processed),
            parse_errors: load(&self.counters.parse_errors),
            ticks_stored: load(&self.counters.ticks_stored),
            cache_errors: load(&self.counters.cache_errors),
            ticks_dropped: self.hub.dropped(),
            reconnects: load(&self.counters.reconnects),
        }
    }

    /// Normalise one text frame. Only terminal errors are returned.
    async fn handle_payload<C>(&self, payload: &str) -> Result<(), DataError>
    where
        C: Connector,
    {
        increment(&self.counters.messages_received);

        match C::normalise(payload) {
            Ok(Some(tick)) => {
                self.process_tick(tick).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) if error.is_terminal() => Err(error),
            Err(error) => {
                increment(&self.counters.parse_errors);
                warn!(exchange = %C::ID, %error, "dropping malformed message");
                Ok(())
            }
        }
    }

    async fn process_tick(&self, tick: Tick) {
        increment(&self.counters.ticks_processed);

        match self.store_tick(&tick).await {
            Ok(()) => increment(&self.counters.ticks_stored),
            Err(error) => {
                increment(&self.counters.cache_errors);
                warn!(symbol = %tick.symbol, tick_id = %tick.id, %error, "failed to store tick");
            }
        }

        self.broadcast_tick(&tick);
    }

    async fn store_tick(&self, tick: &Tick) -> Result<(), DataError> {
        let key = tick_key(tick);
        let value =
            serde_json::to_string(tick).map_err(|error| DataError::Cache(error.to_string()))?;

        self.cache
            .set_ex(&key, value, self.config.tick_retention)
            .await?;

        let list_key = ticks_list_key(&tick.symbol);
        let len = self.cache.lpush(&list_key, key).await?;

        let max = self.config.max_ticks_per_symbol;
        if len > max {
            let stop = isize::try_from(max).unwrap_or(isize::MAX) - 1;
            self.cache.ltrim(&list_key, 0, stop).await?;
        }
        Ok(())
    }

    fn broadcast_tick(&self, tick: &Tick) {
        let delivery = self.hub.broadcast(&tick.symbol, tick);
        if delivery.pruned > 0 {
            debug!(symbol = %tick.symbol, pruned = delivery.pruned, "pruned closed tick subscribers");
        }
    }
}

/// Supervised connection loop for one exchange: connect, subscribe, read until failure, then
/// reconnect after a fixed delay until stopped.
async fn run_connection<C>(
    shared: Arc<Shared>,
    url: Url,
    symbols: Vec<SmolStr>,
    stop: CancellationToken,
) where
    C: Connector,
{
    info!(exchange = %C::ID, %url, ?symbols, "starting exchange connection task");

    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = run_session::<C>(&shared, &url, &symbols, &stop) => result,
        };

        if stop.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => warn!(exchange = %C::ID, "exchange connection ended"),
            Err(error) => warn!(exchange = %C::ID, %error, "exchange connection failed"),
        }

        increment(&shared.counters.reconnects);
        info!(
            exchange = %C::ID,
            delay_secs = shared.config.reconnect_delay.as_secs_f64(),
            "reconnecting after delay"
        );

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
    }

    info!(exchange = %C::ID, "exchange connection task stopped");
}

async fn run_session<C>(
    shared: &Shared,
    url: &Url,
    symbols: &[SmolStr],
    stop: &CancellationToken,
) -> Result<(), DataError>
where
    C: Connector,
{
    let (socket, _) = connect_async(url.as_str()).await?;
    info!(exchange = %C::ID, %url, "connected to exchange");

    let (mut write, read) = socket.split();
    for request in C::requests(symbols) {
        write.send(request).await?;
    }
    debug!(exchange = %C::ID, ?symbols, "sent subscription requests");

    let mut read = IdleTimeout::new(read, shared.config.read_timeout);
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            message = read.next() => message,
        };

        let Some(message) = message else {
            return Err(DataError::Socket(if read.timed_out() {
                format!(
                    "read timeout: no data received for {} seconds",
                    shared.config.read_timeout.as_secs()
                )
            } else {
                "stream terminated".to_string()
            }));
        };

        let result = match message? {
            WsMessage::Text(text) => shared.handle_payload::<C>(text.as_str()).await,
            WsMessage::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => shared.handle_payload::<C>(text).await,
                Err(error) => {
                    debug!(exchange = %C::ID, %error, "ignoring non utf-8 binary frame");
                    Ok(())
                }
            },
            WsMessage::Ping(payload) => {
                write.send(WsMessage::Pong(payload)).await?;
                Ok(())
            }
            WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(()),
            WsMessage::Close(frame) => Err(DataError::Socket(format!(
                "connection closed by exchange: {frame:?}"
            ))),
        };

        result?;
    }
}

async fn run_stats(shared: Arc<Shared>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.stats_interval);
    // First tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let stats = shared.stats();
                info!(
                    messages_received = stats.messages_received,
                    ticks_processed = stats.ticks_processed,
                    parse_errors = stats.parse_errors,
                    ticks_stored = stats.ticks_stored,
                    cache_errors = stats.cache_errors,
                    ticks_dropped = stats.ticks_dropped,
                    reconnects = stats.reconnects,
                    "TickCollector statistics"
                );

                if let Err(error) = shared.cache.ping().await {
                    warn!(%error, "tick cache unreachable");
                }

                match shared.cache.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "purged expired ticks"),
                    Err(error) => warn!(%error, "failed to purge expired ticks"),
                }
            }
        }
    }
}
