use crate::{
    error::ServiceError,
    model::{
        DeltaAnalysisData, FootprintChartData, FootprintMetadata, ImbalanceStats,
        OrderFlowMessage, OrderFlowMetrics, OrderFlowUpdate, ProfileMetadata,
        VolumeProfileChartData,
    },
};
use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use fnv::FnvHashMap;
use orderflow_analysis::{
    DeltaAnalyzer, DeltaProfile, FootprintEngine, ImbalanceDetector, OrderFlowConfig,
    OrderFlowImbalance, TradingSession, VolumeProfiler,
};
use orderflow_data::{
    collector::TickCollector,
    subscriber::{DEFAULT_SUBSCRIBER_CAPACITY, SubscriberHub, Subscription},
    tick::{Side, Tick},
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of an [`OrderFlowService`]. A stopped service cannot be restarted.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub enum ServiceState {
    Created,
    Started,
    Stopped,
}

/// [`OrderFlowService`] configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Symbols to analyse, empty for every symbol the collector subscribes to
    pub symbols: Vec<SmolStr>,
    /// Real time tick processing cadence
    pub processing_interval: Duration,
    /// Footprint and delta analysis cadence
    pub analysis_interval: Duration,
    /// Imbalance detection cadence
    pub imbalance_interval: Duration,
    /// Span of buffered ticks analysed by the periodic loops, measured back from the latest tick
    pub analysis_window: Duration,
    /// Buffered ticks retained per symbol
    pub max_buffered_ticks: usize,
    /// Ticks contributing to the live buy and sell pressure
    pub real_time_window: usize,
    /// Resolved imbalances retained per symbol
    pub max_resolved_imbalances: usize,
    /// Capacity of each order flow subscriber queue
    pub subscriber_capacity: usize,
    /// Analysis parameters used when a query provides none
    pub order_flow: OrderFlowConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            processing_interval: Duration::from_millis(100),
            analysis_interval: Duration::from_secs(1),
            imbalance_interval: Duration::from_millis(500),
            analysis_window: Duration::from_secs(60 * 60),
            max_buffered_ticks: 10_000,
            real_time_window: 1_000,
            max_resolved_imbalances: 500,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            order_flow: OrderFlowConfig::default()
                .with_time_per_row(Duration::from_secs(60 * 60))
                .with_imbalance(dec!(70), dec!(1000)),
        }
    }
}

impl ServiceConfig {
    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_intervals(
        mut self,
        processing: Duration,
        analysis: Duration,
        imbalance: Duration,
    ) -> Self {
        self.processing_interval = processing;
        self.analysis_interval = analysis;
        self.imbalance_interval = imbalance;
        self
    }

    pub fn with_analysis_window(mut self, window: Duration) -> Self {
        self.analysis_window = window;
        self
    }

    pub fn with_max_buffered_ticks(mut self, max: usize) -> Self {
        self.max_buffered_ticks = max;
        self
    }

    pub fn with_real_time_window(mut self, window: usize) -> Self {
        self.real_time_window = window;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn with_order_flow(mut self, config: OrderFlowConfig) -> Self {
        self.order_flow = config;
        self
    }
}

/// Live per symbol state fed by the tick processing loop.
#[derive(Debug)]
struct SymbolState {
    ticks: VecDeque<Tick>,
    metrics: OrderFlowMetrics,
    session: Option<NaiveDate>,
    imbalances: Vec<OrderFlowImbalance>,
    analysis_pending: bool,
    imbalance_pending: bool,
}

impl SymbolState {
    fn new(symbol: SmolStr) -> Self {
        Self {
            ticks: VecDeque::new(),
            metrics: OrderFlowMetrics {
                symbol,
                ..Default::default()
            },
            session: None,
            imbalances: Vec::new(),
            analysis_pending: false,
            imbalance_pending: false,
        }
    }

    /// Buffered ticks within `window` of the most recent one.
    fn window(&self, window: Duration) -> Vec<Tick> {
        let Some(latest) = self.ticks.back().map(|tick| tick.timestamp) else {
            return Vec::new();
        };
        let from = TimeDelta::from_std(window)
            .ok()
            .and_then(|window| latest.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.ticks
            .iter()
            .filter(|tick| tick.timestamp >= from)
            .cloned()
            .collect()
    }
}

struct Lifecycle {
    state: ServiceState,
    stop: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: ServiceConfig,
    symbols: Vec<SmolStr>,
    collector: TickCollector,
    footprint: FootprintEngine,
    profiler: VolumeProfiler,
    delta: DeltaAnalyzer,
    imbalance: ImbalanceDetector,
    hub: SubscriberHub<OrderFlowMessage>,
    state: RwLock<FnvHashMap<SmolStr, SymbolState>>,
    lifecycle: RwLock<Lifecycle>,
}

/// Orchestrates a [`TickCollector`] and the order flow analysers.
///
/// Once started, three periodic loops ingest live ticks, re-run footprint and delta
/// analysis, and track imbalances, publishing [`OrderFlowMessage`]s to per symbol
/// subscribers. Query methods read retained ticks from the collector's cache and are safe
/// to call concurrently.
#[derive(Clone)]
pub struct OrderFlowService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OrderFlowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderFlowService")
            .field("symbols", &self.inner.symbols)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl OrderFlowService {
    pub fn new(config: ServiceConfig, collector: TickCollector) -> Self {
        let symbols = if config.symbols.is_empty() {
            collector.config().symbols()
        } else {
            config.symbols.clone()
        };

        let state = symbols
            .iter()
            .map(|symbol| (symbol.clone(), SymbolState::new(symbol.clone())))
            .collect();

        Self {
            inner: Arc::new(Inner {
                hub: SubscriberHub::new(config.subscriber_capacity),
                config,
                symbols,
                collector,
                footprint: FootprintEngine::new(),
                profiler: VolumeProfiler::new(),
                delta: DeltaAnalyzer::default(),
                imbalance: ImbalanceDetector::new(),
                state: RwLock::new(state),
                lifecycle: RwLock::new(Lifecycle {
                    state: ServiceState::Created,
                    stop: None,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lifecycle.read().state
    }

    pub fn symbols(&self) -> &[SmolStr] {
        &self.inner.symbols
    }

    pub fn collector(&self) -> &TickCollector {
        &self.inner.collector
    }

    /// Start the collector, subscribe to every symbol's ticks and spawn the periodic loops.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let mut lifecycle = self.inner.lifecycle.write();
        if lifecycle.state != ServiceState::Created {
            return Err(ServiceError::InvalidState(lifecycle.state));
        }

        let stop = cancel.child_token();
        self.inner.collector.start(&stop)?;

        let subscriptions = self
            .inner
            .symbols
            .iter()
            .map(|symbol| self.inner.collector.subscribe_to_ticks(symbol.clone()))
            .collect::<Vec<_>>();

        lifecycle.tasks = vec![
            tokio::spawn(run_tick_processing(
                Arc::clone(&self.inner),
                subscriptions,
                stop.clone(),
            )),
            tokio::spawn(run_analysis(Arc::clone(&self.inner), stop.clone())),
            tokio::spawn(run_imbalance_detection(
                Arc::clone(&self.inner),
                stop.clone(),
            )),
        ];
        lifecycle.stop = Some(stop);
        lifecycle.state = ServiceState::Started;

        info!(symbols = ?self.inner.symbols, "OrderFlowService started");
        Ok(())
    }

    /// Stop the periodic loops and the collector, closing every subscriber queue.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let (stop, tasks) = {
            let mut lifecycle = self.inner.lifecycle.write();
            if lifecycle.state == ServiceState::Stopped {
                return;
            }
            lifecycle.state = ServiceState::Stopped;
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
                error!(%error, "OrderFlowService task panicked");
            }
        }

        self.inner.collector.stop().await;
        self.inner.hub.clear();
        info!("OrderFlowService stopped");
    }

    /// True if started and the collector is healthy.
    pub fn is_healthy(&self) -> bool {
        self.state() == ServiceState::Started && self.inner.collector.is_healthy()
    }

    /// Register a bounded queue receiving every [`OrderFlowMessage`] for `symbol`.
    pub fn subscribe_to_order_flow(
        &self,
        symbol: impl Into<SmolStr>,
    ) -> Subscription<OrderFlowMessage> {
        self.inner.hub.subscribe(symbol)
    }

    pub fn unsubscribe_from_order_flow(
        &self,
        subscription: &Subscription<OrderFlowMessage>,
    ) -> bool {
        self.inner.hub.unsubscribe(subscription)
    }

    pub async fn get_footprint_data(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: Option<OrderFlowConfig>,
    ) -> Result<FootprintChartData, ServiceError> {
        let config = self.inner.query_config(symbol, config);
        let ticks = self.inner.collector.recent_ticks(symbol, start, end).await?;
        let bars = self.inner.footprint.generate_footprint_bars(&ticks, &config)?;

        let price_levels = bars
            .iter()
            .map(|bar| bar.price_level)
            .collect::<BTreeSet<_>>()
            .len();

        Ok(FootprintChartData {
            symbol: SmolStr::new(symbol),
            timeframe: SmolStr::new(timeframe),
            start_time: start,
            end_time: end,
            metadata: FootprintMetadata {
                tick_count: ticks.len(),
                bar_count: bars.len(),
                price_levels,
                total_volume: bars.iter().map(|bar| bar.total_volume).sum(),
            },
            bars,
            config,
        })
    }

    /// Volume profile of the retained ticks. A [`TradingSession`] name as `profile_type`
    /// profiles only the ticks within that session.
    pub async fn get_volume_profile(
        &self,
        symbol: &str,
        profile_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: Option<OrderFlowConfig>,
    ) -> Result<VolumeProfileChartData, ServiceError> {
        let config = self.inner.query_config(symbol, config);
        let ticks = self.inner.collector.recent_ticks(symbol, start, end).await?;

        let profiler = &self.inner.profiler;
        let profile = match TradingSession::from_name(profile_type) {
            Some(_) => profiler.generate_session_profile(&ticks, profile_type, &config)?,
            None => profiler.generate_volume_profile(&ticks, profile_type, &config)?,
        };
        let (support, resistance) = profiler.support_resistance(&profile);

        Ok(VolumeProfileChartData {
            symbol: SmolStr::new(symbol),
            profile_type: SmolStr::new(profile_type),
            start_time: start,
            end_time: end,
            metadata: ProfileMetadata {
                tick_count: ticks.len(),
                price_levels: profile.price_levels.len(),
                total_volume: profile.total_volume,
            },
            profile,
            support,
            resistance,
            config,
        })
    }

    /// Delta analysis of the retained ticks.
    ///
    /// Fails with [`AnalysisError::EmptyTicks`](orderflow_analysis::AnalysisError) if no ticks
    /// were retained within the range. History and divergences degrade to empty values.
    pub async fn get_delta_analysis(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: Option<OrderFlowConfig>,
    ) -> Result<DeltaAnalysisData, ServiceError> {
        let config = self.inner.query_config(symbol, config);
        let ticks = self.inner.collector.recent_ticks(symbol, start, end).await?;

        let analyzer = &self.inner.delta;
        let delta_profile = analyzer.analyze_delta(&ticks, &config)?;
        let delta_history = self.inner.delta_history(&ticks, &config);

        let divergences = if config.enable_delta_divergence {
            self.inner.imbalance.detect_delta_divergences(&delta_profile)
        } else {
            Vec::new()
        };

        Ok(DeltaAnalysisData {
            symbol: SmolStr::new(symbol),
            timeframe: SmolStr::new(timeframe),
            start_time: start,
            end_time: end,
            summary: analyzer.delta_summary(&delta_profile),
            history_summary: analyzer.analyze_delta_history(&delta_history),
            signals: analyzer.detect_delta_signals(&delta_profile),
            delta_profile,
            delta_history,
            divergences,
            config,
        })
    }

    /// Latest live metrics for `symbol`, zeroed if no ticks have been processed.
    pub fn get_order_flow_metrics(&self, symbol: &str) -> OrderFlowMetrics {
        self.inner
            .state
            .read()
            .get(symbol)
            .map(|state| state.metrics.clone())
            .unwrap_or_else(|| OrderFlowMetrics {
                symbol: SmolStr::new(symbol),
                timestamp: Utc::now(),
                ..Default::default()
            })
    }

    /// Currently active imbalances for `symbol`, most recent first.
    pub fn get_active_imbalances(&self, symbol: &str) -> Vec<OrderFlowImbalance> {
        self.inner
            .state
            .read()
            .get(symbol)
            .map(|state| self.inner.imbalance.active_imbalances(&state.imbalances))
            .unwrap_or_default()
    }

    /// Summary and resolution statistics over every tracked imbalance for `symbol`.
    pub fn get_imbalance_stats(&self, symbol: &str) -> ImbalanceStats {
        self.inner
            .state
            .read()
            .get(symbol)
            .map(|state| ImbalanceStats {
                summary: self.inner.imbalance.imbalance_summary(&state.imbalances),
                resolution: self.inner.imbalance.resolution_stats(&state.imbalances),
            })
            .unwrap_or_default()
    }
}

impl Inner {
    fn query_config(&self, symbol: &str, config: Option<OrderFlowConfig>) -> OrderFlowConfig {
        config.unwrap_or_else(|| OrderFlowConfig {
            symbol: SmolStr::new(symbol),
            ..self.config.order_flow.clone()
        })
    }

    /// One [`DeltaProfile`] per `time_per_row` bucket of `ticks`, oldest first.
    fn delta_history(&self, ticks: &[Tick], config: &OrderFlowConfig) -> Vec<DeltaProfile> {
        let row = match TimeDelta::from_std(config.time_per_row) {
            Ok(row) if row > TimeDelta::zero() => row,
            _ => {
                warn!(
                    symbol = %config.symbol,
                    time_per_row = ?config.time_per_row,
                    "cannot bucket delta history, substituting empty history"
                );
                return Vec::new();
            }
        };

        let mut buckets = BTreeMap::<DateTime<Utc>, Vec<Tick>>::new();
        for tick in ticks {
            match tick.timestamp.duration_trunc(row) {
                Ok(bucket) => buckets.entry(bucket).or_default().push(tick.clone()),
                Err(error) => {
                    warn!(
                        symbol = %config.symbol,
                        %error,
                        "cannot bucket delta history, substituting empty history"
                    );
                    return Vec::new();
                }
            }
        }

        buckets
            .into_values()
            .filter_map(|bucket| match self.delta.analyze_delta(&bucket, config) {
                Ok(profile) => Some(profile),
                Err(error) => {
                    warn!(symbol = %config.symbol, %error, "skipping delta history bucket");
                    None
                }
            })
            .collect()
    }

    fn publish(&self, symbol: &SmolStr, update: OrderFlowUpdate) {
        let kind = update.label();
        let message = OrderFlowMessage {
            symbol: symbol.clone(),
            timestamp: Utc::now(),
            update,
        };

        let delivery = self.hub.broadcast(symbol, &message);
        if delivery.delivered > 0 || delivery.dropped > 0 {
            debug!(
                %symbol,
                kind,
                delivered = delivery.delivered,
                dropped = delivery.dropped,
                "published order flow update"
            );
        }
    }

    /// Apply a batch of live ticks to the symbol state, returning refreshed metrics.
    fn ingest(&self, symbol: &SmolStr, ticks: Vec<Tick>) -> Option<OrderFlowMetrics> {
        if ticks.is_empty() {
            return None;
        }

        let mut states = self.state.write();
        let state = states
            .entry(symbol.clone())
            .or_insert_with(|| SymbolState::new(symbol.clone()));

        for tick in ticks {
            let day = tick.timestamp.date_naive();
            if state.session != Some(day) {
                state.session = Some(day);
                state.metrics.session_delta = Decimal::ZERO;
            }

            let metrics = &mut state.metrics;
            metrics.timestamp = tick.timestamp;
            metrics.current_price = tick.price;
            metrics.last_trade_volume = tick.volume;
            metrics.last_trade_side = Some(tick.side);
            match tick.side {
                Side::Buy => metrics.ask_price = tick.price,
                Side::Sell => metrics.bid_price = tick.price,
            }
            metrics.cumulative_delta += tick.signed_volume();
            metrics.session_delta += tick.signed_volume();

            state.ticks.push_back(tick);
        }

        while state.ticks.len() > self.config.max_buffered_ticks {
            state.ticks.pop_front();
        }

        let live = self
            .delta
            .real_time_delta(state.ticks.make_contiguous(), self.config.real_time_window);
        state.metrics.buy_pressure = live.buy_pressure;
        state.metrics.sell_pressure = live.sell_pressure;
        state.analysis_pending = true;
        state.imbalance_pending = true;

        Some(state.metrics.clone())
    }

    /// Buffered analysis window of every symbol flagged by `take_pending`.
    fn pending_windows(
        &self,
        take_pending: fn(&mut SymbolState) -> bool,
    ) -> Vec<(SmolStr, Vec<Tick>)> {
        self.state
            .write()
            .iter_mut()
            .filter(|(_, state)| !state.ticks.is_empty())
            .filter_map(|(symbol, state)| {
                take_pending(state)
                    .then(|| (symbol.clone(), state.window(self.config.analysis_window)))
            })
            .collect()
    }

    fn analyse(&self, symbol: &SmolStr, ticks: &[Tick]) {
        let config = self.query_config(symbol, None);

        match self.footprint.generate_footprint_bars(ticks, &config) {
            Ok(bars) => self.publish(symbol, OrderFlowUpdate::Footprint { bars }),
            Err(error) => warn!(%symbol, %error, "footprint analysis failed"),
        }

        match self.delta.analyze_delta(ticks, &config) {
            Ok(profile) => {
                let signals = self.delta.detect_delta_signals(&profile);
                self.publish(symbol, OrderFlowUpdate::Delta { profile, signals });
            }
            Err(error) => warn!(%symbol, %error, "delta analysis failed"),
        }
    }

    fn detect_imbalances(&self, symbol: &SmolStr, ticks: &[Tick]) {
        let config = self.query_config(symbol, None);
        if !config.enable_imbalance_detection {
            return;
        }

        let mut detected = self.imbalance.detect_imbalances(ticks, &config);
        if config.enable_delta_divergence {
            match self.delta.analyze_delta(ticks, &config) {
                Ok(profile) => detected.extend(self.imbalance.detect_delta_divergences(&profile)),
                Err(error) => warn!(%symbol, %error, "delta divergence detection failed"),
            }
        }

        let active = {
            let mut states = self.state.write();
            let Some(state) = states.get_mut(symbol) else {
                return;
            };
            self.track_imbalances(state, detected);
            state.metrics.active_imbalances = state
                .imbalances
                .iter()
                .filter(|imbalance| imbalance.is_active)
                .count();
            self.imbalance.active_imbalances(&state.imbalances)
        };

        if !active.is_empty() {
            self.publish(symbol, OrderFlowUpdate::Imbalances { active });
        }
    }

    /// Merge freshly detected imbalances into the tracked set.
    ///
    /// Active imbalances that are no longer detected are resolved against the current price,
    /// those without a price direction are discarded. A detected imbalance replaces the active
    /// one with the same id but keeps its original detection time. Resolved imbalances stay in
    /// the history even if the same id is detected again.
    fn track_imbalances(&self, state: &mut SymbolState, mut detected: Vec<OrderFlowImbalance>) {
        let now = state.metrics.timestamp;
        let price = state.metrics.current_price;
        let detected_index = detected
            .iter()
            .enumerate()
            .map(|(index, imbalance)| (imbalance.id.clone(), index))
            .collect::<FnvHashMap<_, _>>();

        let mut tracked = Vec::with_capacity(state.imbalances.len() + detected.len());
        for mut imbalance in std::mem::take(&mut state.imbalances) {
            if imbalance.is_active {
                if let Some(&index) = detected_index.get(&imbalance.id) {
                    let persisting = &mut detected[index];
                    let until = persisting.detected_at + persisting.duration;
                    persisting.detected_at = persisting.detected_at.min(imbalance.detected_at);
                    persisting.duration = until - persisting.detected_at;
                    continue;
                }

                let Some(resolution) = self.imbalance.classify_resolution(&imbalance, price) else {
                    continue;
                };
                self.imbalance.resolve(&mut imbalance, resolution, now);
                debug!(
                    symbol = %imbalance.symbol,
                    id = %imbalance.id,
                    %resolution,
                    "imbalance resolved"
                );
            }
            tracked.push(imbalance);
        }

        let resolved = tracked.iter().filter(|imbalance| imbalance.is_resolved).count();
        let mut excess = resolved.saturating_sub(self.config.max_resolved_imbalances);
        tracked.retain(|imbalance| {
            if excess > 0 && imbalance.is_resolved {
                excess -= 1;
                false
            } else {
                true
            }
        });

        tracked.extend(detected);
        state.imbalances = tracked;
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_tick_processing(
    inner: Arc<Inner>,
    mut subscriptions: Vec<Subscription<Tick>>,
    stop: CancellationToken,
) {
    let mut interval = interval(inner.config.processing_interval);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                for subscription in subscriptions.iter_mut() {
                    let mut batch = Vec::with_capacity(subscription.len());
                    while let Some(tick) = subscription.try_recv() {
                        batch.push(tick);
                    }

                    let Some(metrics) = inner.ingest(&subscription.symbol, batch) else {
                        continue;
                    };

                    if inner.config.order_flow.enable_real_time_updates {
                        inner.publish(&subscription.symbol, OrderFlowUpdate::Metrics(metrics));
                    }
                }
            }
        }
    }

    for subscription in &subscriptions {
        inner.collector.unsubscribe_from_ticks(subscription);
    }
    debug!("tick processing loop stopped");
}

async fn run_analysis(inner: Arc<Inner>, stop: CancellationToken) {
    let mut interval = interval(inner.config.analysis_interval);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let pending = inner.pending_windows(|state| {
                    std::mem::take(&mut state.analysis_pending)
                });
                for (symbol, ticks) in pending {
                    inner.analyse(&symbol, &ticks);
                }
            }
        }
    }

    debug!("analysis loop stopped");
}

async fn run_imbalance_detection(inner: Arc<Inner>, stop: CancellationToken) {
    let mut interval = interval(inner.config.imbalance_interval);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let pending = inner.pending_windows(|state| {
                    std::mem::take(&mut state.imbalance_pending)
                });
                for (symbol, ticks) in pending {
                    inner.detect_imbalances(&symbol, &ticks);
                }
            }
        }
    }

    debug!("imbalance detection loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow_analysis::imbalance::{ImbalanceType, Resolution, Severity};
    use orderflow_data::{
        collector::{CollectorConfig, ExchangeSubscription},
        exchange::ExchangeId,
    };
    use url::Url;

    fn offline_collector() -> TickCollector {
        let subscription = ExchangeSubscription::new(ExchangeId::Binance, ["BTCUSDT"])
            .with_url(Url::parse("ws://127.0.0.1:9").unwrap());
        let config =
            CollectorConfig::new(vec![subscription]).with_reconnect_delay(Duration::from_secs(60));
        TickCollector::in_memory(config).unwrap()
    }

    fn fast_config() -> ServiceConfig {
        ServiceConfig::default().with_intervals(
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(20),
        )
    }

    fn tick(seconds: i64, price: Decimal, volume: Decimal, side: Side) -> Tick {
        Tick {
            id: format!("binance_{seconds}"),
            symbol: SmolStr::new_static("BTCUSDT"),
            price,
            volume,
            side,
            exchange: ExchangeId::Binance,
            timestamp: at(seconds),
            is_aggressor: side == Side::Buy,
            sequence: seconds as u64,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    async fn next_update(
        subscription: &mut Subscription<OrderFlowMessage>,
        kind: &str,
    ) -> OrderFlowMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match subscription.recv().await {
                    Some(message) if message.update.label() == kind => return message,
                    Some(_) => continue,
                    None => panic!("subscription closed"),
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let cancel = CancellationToken::new();
        assert_eq!(service.state(), ServiceState::Created);
        assert!(!service.is_healthy());
        assert_eq!(service.symbols(), &[SmolStr::new_static("BTCUSDT")]);

        service.start(&cancel).unwrap();
        assert_eq!(service.state(), ServiceState::Started);
        assert!(service.is_healthy());
        assert!(matches!(
            service.start(&cancel),
            Err(ServiceError::InvalidState(ServiceState::Started))
        ));

        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!service.is_healthy());

        // Idempotent, and no restart
        service.stop().await;
        assert!(matches!(
            service.start(&cancel),
            Err(ServiceError::InvalidState(ServiceState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_parent_cancellation_marks_unhealthy() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let cancel = CancellationToken::new();

        service.start(&cancel).unwrap();
        cancel.cancel();
        assert!(!service.is_healthy());

        service.stop().await;
    }

    #[tokio::test]
    async fn test_live_metrics_published() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let cancel = CancellationToken::new();
        let mut updates = service.subscribe_to_order_flow("BTCUSDT");
        service.start(&cancel).unwrap();

        let collector = service.collector().clone();
        collector
            .process_tick(tick(0, dec!(100), dec!(3), Side::Buy))
            .await;
        collector
            .process_tick(tick(1, dec!(99), dec!(1), Side::Sell))
            .await;

        let mut metrics = None;
        for _ in 0..2 {
            let message = next_update(&mut updates, "metrics").await;
            if let OrderFlowUpdate::Metrics(latest) = message.update {
                if latest.last_trade_side == Some(Side::Sell) {
                    metrics = Some(latest);
                    break;
                }
            }
        }

        let metrics = metrics.unwrap();
        assert_eq!(metrics.current_price, dec!(99));
        assert_eq!(metrics.ask_price, dec!(100));
        assert_eq!(metrics.bid_price, dec!(99));
        assert_eq!(metrics.cumulative_delta, dec!(2));
        assert_eq!(metrics.session_delta, dec!(2));
        assert_eq!(metrics.buy_pressure, dec!(75));
        assert_eq!(metrics.sell_pressure, dec!(25));
        assert_eq!(
            service.get_order_flow_metrics("BTCUSDT").cumulative_delta,
            dec!(2)
        );

        let footprint = next_update(&mut updates, "footprint").await;
        assert_eq!(footprint.symbol, "BTCUSDT");
        let delta = next_update(&mut updates, "delta").await;
        assert!(matches!(delta.update, OrderFlowUpdate::Delta { .. }));

        assert!(service.unsubscribe_from_order_flow(&updates));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_queries_read_retained_ticks() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let collector = service.collector().clone();

        for tick in [
            tick(0, dec!(100), dec!(2), Side::Buy),
            tick(1, dec!(100), dec!(1), Side::Sell),
            tick(2, dec!(101), dec!(4), Side::Buy),
            tick(7_200, dec!(102), dec!(1), Side::Sell),
        ] {
            collector.process_tick(tick).await;
        }

        let config = OrderFlowConfig::new("BTCUSDT").with_price_tick_size(dec!(1));

        let footprint = service
            .get_footprint_data("BTCUSDT", "1h", at(0), at(2), Some(config.clone()))
            .await
            .unwrap();
        assert_eq!(footprint.metadata.tick_count, 3);
        assert_eq!(footprint.metadata.bar_count, 2);
        assert_eq!(footprint.metadata.price_levels, 2);
        assert_eq!(footprint.metadata.total_volume, dec!(7));
        assert_eq!(footprint.timeframe, "1h");

        let profile = service
            .get_volume_profile("BTCUSDT", "VPVR", at(0), at(7_200), Some(config.clone()))
            .await
            .unwrap();
        assert_eq!(profile.metadata.tick_count, 4);
        assert_eq!(profile.profile.point_of_control, dec!(101));
        assert!(profile.support.contains(&dec!(101)));
        assert!(profile.resistance.contains(&dec!(101)));

        let delta = service
            .get_delta_analysis(
                "BTCUSDT",
                "1h",
                at(0),
                at(7_200),
                Some(config.clone().with_time_per_row(Duration::from_secs(3_600))),
            )
            .await
            .unwrap();
        assert_eq!(delta.delta_profile.cumulative_delta, dec!(4));
        assert_eq!(delta.delta_history.len(), 2);
        assert_eq!(delta.history_summary.total_profiles, 2);

        let empty = service
            .get_delta_analysis("BTCUSDT", "1h", at(100), at(200), Some(config))
            .await;
        assert!(matches!(empty, Err(ServiceError::Analysis(_))));
    }

    #[tokio::test]
    async fn test_query_defaults_to_service_config() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        service
            .collector()
            .process_tick(tick(0, dec!(100), dec!(1), Side::Buy))
            .await;

        let footprint = service
            .get_footprint_data("BTCUSDT", "1h", at(0), at(0), None)
            .await
            .unwrap();
        assert_eq!(footprint.config.symbol, "BTCUSDT");
        assert_eq!(footprint.config.time_per_row, Duration::from_secs(3_600));
        assert_eq!(footprint.config.imbalance_min_volume, dec!(1000));
    }

    #[test]
    fn test_track_imbalances_resolves_vanished() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let inner = &service.inner;

        let stack = |id: &str, kind: ImbalanceType| OrderFlowImbalance {
            id: id.to_string(),
            symbol: SmolStr::new_static("BTCUSDT"),
            price: dec!(100),
            imbalance_type: kind,
            severity: Severity::Medium,
            buy_volume: dec!(5),
            sell_volume: dec!(0),
            imbalance_ratio: dec!(100),
            duration: TimeDelta::seconds(1),
            is_active: true,
            is_resolved: false,
            resolution_type: None,
            detected_at: at(0),
            resolved_at: None,
        };

        let mut state = SymbolState::new(SmolStr::new_static("BTCUSDT"));
        state.metrics.current_price = dec!(101);
        state.metrics.timestamp = at(10);

        inner.track_imbalances(
            &mut state,
            vec![
                stack("bid", ImbalanceType::BidStack),
                stack("divergence", ImbalanceType::DeltaDivergence),
                stack("kept", ImbalanceType::AskStack),
            ],
        );
        assert_eq!(state.imbalances.len(), 3);

        // Only "kept" is detected again
        inner.track_imbalances(&mut state, vec![stack("kept", ImbalanceType::AskStack)]);

        let summary = state
            .imbalances
            .iter()
            .map(|imbalance| {
                (
                    imbalance.id.as_str(),
                    imbalance.is_active,
                    imbalance.resolution_type,
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("bid", false, Some(Resolution::Continuation)),
                ("kept", true, None),
            ]
        );
        assert_eq!(state.imbalances[0].resolved_at, Some(at(10)));
    }

    #[test]
    fn test_track_imbalances_stable_across_sliding_window() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let inner = &service.inner;
        let config = OrderFlowConfig::new("BTCUSDT")
            .with_price_tick_size(dec!(1))
            .with_imbalance(dec!(70), dec!(2));

        // A lone sell then a five trade bid stack
        let mut ticks = vec![tick(0, dec!(200), dec!(1), Side::Sell)];
        ticks.extend((1..=5).map(|second| tick(second, dec!(100), dec!(1), Side::Buy)));

        let mut state = SymbolState::new(SmolStr::new_static("BTCUSDT"));
        state.metrics.current_price = dec!(100);
        state.metrics.timestamp = at(5);

        inner.track_imbalances(&mut state, inner.imbalance.detect_imbalances(&ticks, &config));
        let first = inner.imbalance.active_imbalances(&state.imbalances);
        assert_eq!(first.len(), 2);

        // Oldest trade leaves the window
        inner.track_imbalances(
            &mut state,
            inner.imbalance.detect_imbalances(&ticks[1..], &config),
        );

        let stats = inner.imbalance.resolution_stats(&state.imbalances);
        assert_eq!(stats.total_imbalances, 2);
        assert_eq!(stats.resolved_count, 0);
        assert_eq!(inner.imbalance.active_imbalances(&state.imbalances), first);
    }

    #[test]
    fn test_track_imbalances_keeps_resolved_history() {
        let service = OrderFlowService::new(fast_config(), offline_collector());
        let inner = &service.inner;

        let bid_stack = |detected: i64| OrderFlowImbalance {
            id: "BTCUSDT:BID_STACK:100".to_string(),
            symbol: SmolStr::new_static("BTCUSDT"),
            price: dec!(100),
            imbalance_type: ImbalanceType::BidStack,
            severity: Severity::Low,
            buy_volume: dec!(5),
            sell_volume: dec!(0),
            imbalance_ratio: dec!(100),
            duration: TimeDelta::seconds(1),
            is_active: true,
            is_resolved: false,
            resolution_type: None,
            detected_at: at(detected),
            resolved_at: None,
        };

        let mut state = SymbolState::new(SmolStr::new_static("BTCUSDT"));
        state.metrics.current_price = dec!(101);
        state.metrics.timestamp = at(3);

        inner.track_imbalances(&mut state, vec![bid_stack(0)]);
        inner.track_imbalances(&mut state, Vec::new());

        // Same level forms again after resolving
        inner.track_imbalances(&mut state, vec![bid_stack(5)]);
        // and persists into the next pass
        inner.track_imbalances(&mut state, vec![bid_stack(8)]);

        let stats = inner.imbalance.resolution_stats(&state.imbalances);
        assert_eq!(stats.total_imbalances, 2);
        assert_eq!(stats.resolved_count, 1);
        assert_eq!(stats.continuation_count, 1);

        let active = inner.imbalance.active_imbalances(&state.imbalances);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].detected_at, at(5));
        assert_eq!(active[0].duration, TimeDelta::seconds(4));
    }

    #[tokio::test]
    async fn test_imbalances_tracked_from_live_ticks() {
        let config = fast_config().with_order_flow(
            OrderFlowConfig::default()
                .with_price_tick_size(dec!(1))
                .with_imbalance(dec!(70), dec!(0)),
        );
        let service = OrderFlowService::new(config, offline_collector());
        let cancel = CancellationToken::new();
        let mut updates = service.subscribe_to_order_flow("BTCUSDT");
        service.start(&cancel).unwrap();

        service
            .collector()
            .process_tick(tick(0, dec!(100), dec!(5), Side::Buy))
            .await;

        let message = next_update(&mut updates, "imbalances").await;
        let OrderFlowUpdate::Imbalances { active } = message.update else {
            panic!("unexpected update");
        };
        assert!(
            active
                .iter()
                .any(|imbalance| imbalance.imbalance_type == ImbalanceType::BidStack)
        );

        assert_eq!(service.get_active_imbalances("BTCUSDT").len(), 1);
        assert_eq!(service.get_order_flow_metrics("BTCUSDT").active_imbalances, 1);
        assert_eq!(service.get_imbalance_stats("BTCUSDT").summary.active_count, 1);
        assert!(service.get_active_imbalances("ETHUSDT").is_empty());

        service.stop().await;
    }
}
