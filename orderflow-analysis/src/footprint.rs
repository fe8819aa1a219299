use crate::{
    aggregation::{round_to_tick, sorted_by_time},
    config::{AggregationMethod, OrderFlowConfig},
    error::AnalysisError,
};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use indexmap::IndexMap;
use orderflow_data::tick::{Side, Tick};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::debug;

/// Aggregated buy/sell activity at one price level within one aggregation bucket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FootprintBar {
    /// `{symbol}:{bucket_index}:{price_level}`
    pub id: String,
    pub symbol: SmolStr,
    pub timeframe: AggregationMethod,
    pub bucket: usize,
    pub price_level: Decimal,
    pub tick_size: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_volume: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub max_buy_volume: Decimal,
    pub max_sell_volume: Decimal,
    pub delta: Decimal,
    /// Percent, see [`volume_imbalance`]
    pub volume_imbalance: Decimal,
    pub is_point_of_control: bool,
    pub is_imbalanced: bool,
}

/// `(buy / sell - 1) × 100`.
///
/// Without sell volume the imbalance is 100% for a buy only level and 0% for an empty one.
pub fn volume_imbalance(buy_volume: Decimal, sell_volume: Decimal) -> Decimal {
    if sell_volume.is_zero() {
        return if buy_volume > Decimal::ZERO {
            Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
    }

    buy_volume
        .checked_div(sell_volume)
        .and_then(|ratio| (ratio - Decimal::ONE).checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::MAX)
}

#[derive(Debug, Clone)]
struct LevelAccumulator {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    buy_volume: Decimal,
    sell_volume: Decimal,
    buy_trades: usize,
    sell_trades: usize,
    max_buy_volume: Decimal,
    max_sell_volume: Decimal,
}

impl LevelAccumulator {
    fn new(tick: &Tick) -> Self {
        Self {
            start_time: tick.timestamp,
            end_time: tick.timestamp,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            buy_trades: 0,
            sell_trades: 0,
            max_buy_volume: Decimal::ZERO,
            max_sell_volume: Decimal::ZERO,
        }
    }

    fn add(&mut self, tick: &Tick) {
        self.start_time = self.start_time.min(tick.timestamp);
        self.end_time = self.end_time.max(tick.timestamp);

        match tick.side {
            Side::Buy => {
                self.buy_volume += tick.volume;
                self.buy_trades += 1;
                self.max_buy_volume = self.max_buy_volume.max(tick.volume);
            }
            Side::Sell => {
                self.sell_volume += tick.volume;
                self.sell_trades += 1;
                self.max_sell_volume = self.max_sell_volume.max(tick.volume);
            }
        }
    }

    fn total_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }
}

/// Price levels of one bucket, ascending by price.
type Bucket = BTreeMap<Decimal, LevelAccumulator>;

fn add_to_bucket(bucket: &mut Bucket, tick: &Tick, tick_size: Decimal) {
    bucket
        .entry(round_to_tick(tick.price, tick_size))
        .or_insert_with(|| LevelAccumulator::new(tick))
        .add(tick);
}

/// Generates [`FootprintBar`]s from trade ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FootprintEngine;

impl FootprintEngine {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate `ticks` into footprint bars ordered by bucket then ascending price.
    ///
    /// Ticks are sorted by timestamp first so input order is irrelevant. Empty input yields
    /// no bars.
    pub fn generate_footprint_bars(
        &self,
        ticks: &[Tick],
        config: &OrderFlowConfig,
    ) -> Result<Vec<FootprintBar>, AnalysisError> {
        config.validate()?;
        if ticks.is_empty() {
            return Ok(Vec::new());
        }

        let sorted = sorted_by_time(ticks);
        let tick_size = config.price_tick_size;

        let buckets = match config.tick_aggregation_method {
            AggregationMethod::Time => bucket_by_time(&sorted, tick_size, config.time_per_row)?,
            AggregationMethod::Volume => {
                if config.volume_per_row <= Decimal::ZERO {
                    return Err(AnalysisError::InvalidConfig(format!(
                        "volume_per_row must be positive: {}",
                        config.volume_per_row
                    )));
                }
                let per_row = config.volume_per_row;
                bucket_until(&sorted, tick_size, |volume, _| volume >= per_row)
            }
            AggregationMethod::TickCount => {
                if config.ticks_per_row == 0 {
                    return Err(AnalysisError::InvalidConfig(
                        "ticks_per_row must be positive".to_string(),
                    ));
                }
                let per_row = config.ticks_per_row;
                bucket_until(&sorted, tick_size, |_, count| count >= per_row)
            }
        };

        let symbol = sorted
            .first()
            .map(|tick| tick.symbol.clone())
            .unwrap_or_else(|| config.symbol.clone());

        let bars = buckets
            .into_iter()
            .enumerate()
            .flat_map(|(index, bucket)| build_bars(&symbol, index, bucket, config))
            .collect::<Vec<_>>();

        debug!(
            %symbol,
            method = %config.tick_aggregation_method,
            ticks = ticks.len(),
            bars = bars.len(),
            "generated footprint bars"
        );

        Ok(bars)
    }
}

/// Bucket key is the tick timestamp truncated to `time_per_row`.
fn bucket_by_time(
    ticks: &[&Tick],
    tick_size: Decimal,
    time_per_row: std::time::Duration,
) -> Result<Vec<Bucket>, AnalysisError> {
    let row = TimeDelta::from_std(time_per_row)
        .ok()
        .filter(|row| *row > TimeDelta::zero())
        .ok_or_else(|| {
            AnalysisError::InvalidConfig(format!(
                "time_per_row must be positive: {time_per_row:?}"
            ))
        })?;

    // Ticks are sorted so buckets are inserted in ascending time order
    let mut buckets = IndexMap::<DateTime<Utc>, Bucket>::new();
    for tick in ticks {
        let start = tick
            .timestamp
            .duration_trunc(row)
            .map_err(|error| AnalysisError::InvalidConfig(error.to_string()))?;

        add_to_bucket(buckets.entry(start).or_default(), tick, tick_size);
    }

    Ok(buckets.into_values().collect())
}

/// Accumulate open levels until `sealed(running_volume, running_count)` holds, then seal
/// every open level and start a new bucket.
fn bucket_until<F>(ticks: &[&Tick], tick_size: Decimal, sealed: F) -> Vec<Bucket>
where
    F: Fn(Decimal, usize) -> bool,
{
    let mut buckets = Vec::new();
    let mut open = Bucket::new();
    let mut volume = Decimal::ZERO;
    let mut count = 0;

    for tick in ticks {
        add_to_bucket(&mut open, tick, tick_size);
        volume += tick.volume;
        count += 1;

        if sealed(volume, count) {
            buckets.push(std::mem::take(&mut open));
            volume = Decimal::ZERO;
            count = 0;
        }
    }

    if !open.is_empty() {
        buckets.push(open);
    }

    buckets
}

fn build_bars(
    symbol: &SmolStr,
    index: usize,
    bucket: Bucket,
    config: &OrderFlowConfig,
) -> Vec<FootprintBar> {
    // First encountered in ascending price wins ties
    let point_of_control = bucket
        .iter()
        .fold(None::<(Decimal, Decimal)>, |best, (price, level)| {
            let volume = level.total_volume();
            match best {
                Some((_, best_volume)) if volume <= best_volume => best,
                _ => Some((*price, volume)),
            }
        })
        .map(|(price, _)| price);

    bucket
        .into_iter()
        .map(|(price_level, level)| {
            let total_volume = level.total_volume();
            let volume_imbalance = volume_imbalance(level.buy_volume, level.sell_volume);

            FootprintBar {
                id: format!("{symbol}:{index}:{price_level}"),
                symbol: symbol.clone(),
                timeframe: config.tick_aggregation_method,
                bucket: index,
                price_level,
                tick_size: config.price_tick_size,
                start_time: level.start_time,
                end_time: level.end_time,
                total_volume,
                buy_volume: level.buy_volume,
                sell_volume: level.sell_volume,
                total_trades: level.buy_trades + level.sell_trades,
                buy_trades: level.buy_trades,
                sell_trades: level.sell_trades,
                max_buy_volume: level.max_buy_volume,
                max_sell_volume: level.max_sell_volume,
                delta: level.buy_volume - level.sell_volume,
                volume_imbalance,
                is_point_of_control: point_of_control == Some(price_level),
                is_imbalanced: total_volume >= config.imbalance_min_volume
                    && volume_imbalance.abs() >= config.imbalance_threshold,
            }
        })
        .collect()
}
