use crate::{
    aggregation::{percentage, side_volumes, sorted_by_time},
    config::{AggregationMethod, OrderFlowConfig},
    error::AnalysisError,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use itertools::Itertools;
use orderflow_data::tick::Tick;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

/// Smoothing period used when the configured period is zero.
const DEFAULT_SMOOTHING_PERIOD: usize = 10;

/// Net pressure beyond which [`DeltaSummary`] sentiment leaves neutral.
const SENTIMENT_NET_PRESSURE: Decimal = dec!(20);

/// Cumulative delta analysis over a tick range.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct DeltaProfile {
    /// `{symbol}:{timeframe}:{start_ms}:{end_ms}`
    pub id: String,
    pub symbol: SmolStr,
    pub timeframe: AggregationMethod,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cumulative_delta: Decimal,
    pub delta_high: Decimal,
    pub delta_low: Decimal,
    pub delta_range: Decimal,
    pub delta_momentum: Decimal,
    pub delta_acceleration: Decimal,
    pub buy_pressure: Decimal,
    pub sell_pressure: Decimal,
    pub net_pressure: Decimal,
    pub delta_strength: Decimal,
    pub is_divergent: bool,
    pub is_exhausted: bool,
}

/// Tunable thresholds for divergence, exhaustion and pressure signals.
///
/// Comparisons are strict: a profile is divergent when `momentum < 0` and
/// `strength > divergence_strength`, exhausted when `strength > exhaustion_strength` and
/// `momentum < exhaustion_momentum`.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeltaThresholds {
    pub divergence_strength: Decimal,
    pub exhaustion_strength: Decimal,
    pub exhaustion_momentum: Decimal,
    pub pressure_signal: Decimal,
}

impl Default for DeltaThresholds {
    fn default() -> Self {
        Self {
            divergence_strength: dec!(60),
            exhaustion_strength: dec!(80),
            exhaustion_momentum: dec!(-10),
            pressure_signal: dec!(70),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaSignalKind {
    #[display("BUY_PRESSURE")]
    BuyPressure,
    #[display("SELL_PRESSURE")]
    SellPressure,
    #[display("DIVERGENCE")]
    Divergence,
    #[display("EXHAUSTION")]
    Exhaustion,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalBias {
    #[display("BULLISH")]
    Bullish,
    #[display("BEARISH")]
    Bearish,
    #[display("REVERSAL")]
    Reversal,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStrength {
    #[display("MEDIUM")]
    Medium,
    #[display("HIGH")]
    High,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeltaSignal {
    pub kind: DeltaSignalKind,
    pub bias: SignalBias,
    pub strength: SignalStrength,
    pub description: SmolStr,
    /// Percent
    pub confidence: u8,
}

impl DeltaSignal {
    fn new(
        kind: DeltaSignalKind,
        bias: SignalBias,
        strength: SignalStrength,
        description: &'static str,
        confidence: u8,
    ) -> Self {
        Self {
            kind,
            bias,
            strength,
            description: SmolStr::new_static(description),
            confidence,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    #[display("BULLISH")]
    Bullish,
    #[display("BEARISH")]
    Bearish,
    #[default]
    #[display("NEUTRAL")]
    Neutral,
}

impl Sentiment {
    /// Direction of `value` relative to `band`, neutral within `[-band, band]`.
    fn from_band(value: Decimal, band: Decimal) -> Self {
        if value > band {
            Sentiment::Bullish
        } else if value < -band {
            Sentiment::Bearish
        } else {
            Sentiment::Neutral
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MomentumDirection {
    #[display("POSITIVE")]
    Positive,
    #[display("NEGATIVE")]
    Negative,
    #[default]
    #[display("NEUTRAL")]
    Neutral,
}

/// Aggregate statistics over a set of historical [`DeltaProfile`]s.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct DeltaHistorySummary {
    pub total_profiles: usize,
    pub divergent_count: usize,
    pub exhausted_count: usize,
    /// Percent
    pub divergence_rate: Decimal,
    /// Percent
    pub exhaustion_rate: Decimal,
    pub avg_delta_strength: Decimal,
    pub avg_buy_pressure: Decimal,
    pub avg_sell_pressure: Decimal,
    pub current_trend: Sentiment,
}

/// Delta over the most recent window of ticks.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct RealTimeDelta {
    pub cumulative_delta: Decimal,
    pub buy_pressure: Decimal,
    pub sell_pressure: Decimal,
    pub net_pressure: Decimal,
    pub total_volume: Decimal,
    pub window_size: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct DeltaSummary {
    pub cumulative_delta: Decimal,
    pub delta_high: Decimal,
    pub delta_low: Decimal,
    pub delta_range: Decimal,
    pub delta_momentum: Decimal,
    pub delta_acceleration: Decimal,
    pub buy_pressure: Decimal,
    pub sell_pressure: Decimal,
    pub net_pressure: Decimal,
    pub delta_strength: Decimal,
    pub is_divergent: bool,
    pub is_exhausted: bool,
    pub sentiment: Sentiment,
    pub momentum_direction: MomentumDirection,
}

/// Cumulative delta, momentum and pressure analysis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeltaAnalyzer {
    pub thresholds: DeltaThresholds,
}

impl DeltaAnalyzer {
    pub fn new(thresholds: DeltaThresholds) -> Self {
        Self { thresholds }
    }

    pub fn analyze_delta(
        &self,
        ticks: &[Tick],
        config: &OrderFlowConfig,
    ) -> Result<DeltaProfile, AnalysisError> {
        let sorted = sorted_by_time(ticks);
        let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
            return Err(AnalysisError::EmptyTicks);
        };

        let timeframe = config.tick_aggregation_method;
        let mut profile = DeltaProfile {
            id: format!(
                "{}:{}:{}:{}",
                first.symbol,
                timeframe,
                first.timestamp.timestamp_millis(),
                last.timestamp.timestamp_millis()
            ),
            symbol: first.symbol.clone(),
            timeframe,
            start_time: first.timestamp,
            end_time: last.timestamp,
            ..Default::default()
        };

        // Running high and low start from the first cumulative value
        let mut cumulative = Decimal::ZERO;
        let mut high = first.signed_volume();
        let mut low = high;
        for tick in &sorted {
            cumulative += tick.signed_volume();
            high = high.max(cumulative);
            low = low.min(cumulative);
        }
        profile.cumulative_delta = cumulative;
        profile.delta_high = high;
        profile.delta_low = low;
        profile.delta_range = high - low;

        let (momentum, acceleration) = momentum(&sorted, config.delta_smoothing_period);
        profile.delta_momentum = momentum;
        profile.delta_acceleration = acceleration;

        let (buy_volume, sell_volume) = side_volumes(sorted.iter().copied());
        let total_volume = buy_volume + sell_volume;
        profile.buy_pressure = percentage(buy_volume, total_volume);
        profile.sell_pressure = percentage(sell_volume, total_volume);
        profile.net_pressure = profile.buy_pressure - profile.sell_pressure;
        profile.delta_strength = profile.net_pressure.abs();

        let thresholds = &self.thresholds;
        profile.is_divergent = profile.delta_momentum < Decimal::ZERO
            && profile.delta_strength > thresholds.divergence_strength;
        profile.is_exhausted = profile.delta_strength > thresholds.exhaustion_strength
            && profile.delta_momentum < thresholds.exhaustion_momentum;

        if profile.is_divergent || profile.is_exhausted {
            debug!(
                symbol = %profile.symbol,
                momentum = %profile.delta_momentum,
                strength = %profile.delta_strength,
                divergent = profile.is_divergent,
                exhausted = profile.is_exhausted,
                "delta reversal conditions detected"
            );
        }

        Ok(profile)
    }

    /// Signals implied by a [`DeltaProfile`], in a fixed order.
    pub fn detect_delta_signals(&self, profile: &DeltaProfile) -> Vec<DeltaSignal> {
        let mut signals = Vec::new();
        let pressure_signal = self.thresholds.pressure_signal;

        if profile.buy_pressure > pressure_signal && profile.delta_momentum > Decimal::ZERO {
            signals.push(DeltaSignal::new(
                DeltaSignalKind::BuyPressure,
                SignalBias::Bullish,
                SignalStrength::High,
                "Strong buying pressure with positive momentum",
                85,
            ));
        }

        if profile.sell_pressure > pressure_signal && profile.delta_momentum < Decimal::ZERO {
            signals.push(DeltaSignal::new(
                DeltaSignalKind::SellPressure,
                SignalBias::Bearish,
                SignalStrength::High,
                "Strong selling pressure with negative momentum",
                85,
            ));
        }

        if profile.is_divergent {
            signals.push(DeltaSignal::new(
                DeltaSignalKind::Divergence,
                SignalBias::Reversal,
                SignalStrength::Medium,
                "Delta divergence detected - potential reversal",
                70,
            ));
        }

        if profile.is_exhausted {
            signals.push(DeltaSignal::new(
                DeltaSignalKind::Exhaustion,
                SignalBias::Reversal,
                SignalStrength::High,
                "Delta exhaustion detected - trend may reverse",
                80,
            ));
        }

        signals
    }

    /// Summarise historical profiles. The trend compares the two most recent cumulative deltas.
    pub fn analyze_delta_history(&self, profiles: &[DeltaProfile]) -> DeltaHistorySummary {
        if profiles.is_empty() {
            return DeltaHistorySummary::default();
        }

        let sorted = profiles
            .iter()
            .sorted_by_key(|profile| profile.start_time)
            .collect::<Vec<_>>();

        let total = Decimal::from(sorted.len());
        let divergent_count = sorted.iter().filter(|profile| profile.is_divergent).count();
        let exhausted_count = sorted.iter().filter(|profile| profile.is_exhausted).count();
        let average = |field: fn(&DeltaProfile) -> Decimal| {
            sorted.iter().map(|profile| field(profile)).sum::<Decimal>() / total
        };

        let current_trend = match sorted.as_slice() {
            [.., previous, recent] => Sentiment::from_band(
                recent.cumulative_delta - previous.cumulative_delta,
                Decimal::ZERO,
            ),
            _ => Sentiment::Neutral,
        };

        DeltaHistorySummary {
            total_profiles: sorted.len(),
            divergent_count,
            exhausted_count,
            divergence_rate: percentage(Decimal::from(divergent_count), total),
            exhaustion_rate: percentage(Decimal::from(exhausted_count), total),
            avg_delta_strength: average(|profile| profile.delta_strength),
            avg_buy_pressure: average(|profile| profile.buy_pressure),
            avg_sell_pressure: average(|profile| profile.sell_pressure),
            current_trend,
        }
    }

    /// Delta over the last `window` ticks of `ticks`, taken in the order given.
    pub fn real_time_delta(&self, ticks: &[Tick], window: usize) -> RealTimeDelta {
        let window_ticks = &ticks[ticks.len().saturating_sub(window)..];

        let (buy_volume, sell_volume) = side_volumes(window_ticks);
        let total_volume = buy_volume + sell_volume;
        let buy_pressure = percentage(buy_volume, total_volume);
        let sell_pressure = percentage(sell_volume, total_volume);

        RealTimeDelta {
            cumulative_delta: buy_volume - sell_volume,
            buy_pressure,
            sell_pressure,
            net_pressure: buy_pressure - sell_pressure,
            total_volume,
            window_size: window_ticks.len(),
        }
    }

    pub fn delta_summary(&self, profile: &DeltaProfile) -> DeltaSummary {
        let momentum_direction = match profile.delta_momentum {
            momentum if momentum > Decimal::ZERO => MomentumDirection::Positive,
            momentum if momentum < Decimal::ZERO => MomentumDirection::Negative,
            _ => MomentumDirection::Neutral,
        };

        DeltaSummary {
            cumulative_delta: profile.cumulative_delta,
            delta_high: profile.delta_high,
            delta_low: profile.delta_low,
            delta_range: profile.delta_range,
            delta_momentum: profile.delta_momentum,
            delta_acceleration: profile.delta_acceleration,
            buy_pressure: profile.buy_pressure,
            sell_pressure: profile.sell_pressure,
            net_pressure: profile.net_pressure,
            delta_strength: profile.delta_strength,
            is_divergent: profile.is_divergent,
            is_exhausted: profile.is_exhausted,
            sentiment: Sentiment::from_band(profile.net_pressure, SENTIMENT_NET_PRESSURE),
            momentum_direction,
        }
    }
}

/// `(momentum, acceleration)` of chunked delta sums.
///
/// Ticks are split into chunks of `len / period` (at least one tick). Momentum is the change
/// between the last two chunks and acceleration the change in momentum over the last three.
fn momentum(ticks: &[&Tick], period: usize) -> (Decimal, Decimal) {
    if ticks.len() < 2 {
        return (Decimal::ZERO, Decimal::ZERO);
    }

    let period = if period == 0 {
        DEFAULT_SMOOTHING_PERIOD
    } else {
        period
    };
    let chunk_size = (ticks.len() / period).max(1);

    let sums = ticks
        .chunks(chunk_size)
        .map(|chunk| chunk.iter().map(|tick| tick.signed_volume()).sum::<Decimal>())
        .collect::<Vec<_>>();

    match sums.as_slice() {
        [.., before_previous, previous, current] => (
            *current - *previous,
            (*current - *previous) - (*previous - *before_previous),
        ),
        [previous, current] => (*current - *previous, Decimal::ZERO),
        _ => (Decimal::ZERO, Decimal::ZERO),
    }
}
