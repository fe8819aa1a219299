use crate::{
    aggregation::{percentage, round_to_tick, side_volumes, sorted_by_time},
    config::OrderFlowConfig,
    delta::DeltaProfile,
};
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use indexmap::IndexMap;
use orderflow_data::tick::{Side, Tick};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::debug;

/// Minimum run of same side trades forming a stack.
const STACK_MIN_TRADES: usize = 5;

/// Run length at which a stack is rated [`Severity::High`].
const STACK_HIGH_TRADES: usize = 10;

/// Maximum distance from the first trade of a stack, percent of its price.
const STACK_PRICE_TOLERANCE: Decimal = dec!(0.1);

const ABSORPTION_WINDOW: usize = 20;

/// Maximum price range of an absorption window, percent of its mid price.
const ABSORPTION_MAX_RANGE: Decimal = dec!(0.2);

const DIVERGENCE_HIGH_STRENGTH: Decimal = dec!(80);

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImbalanceType {
    #[display("BID_STACK")]
    BidStack,
    #[display("ASK_STACK")]
    AskStack,
    #[display("BUY_ABSORPTION")]
    BuyAbsorption,
    #[display("SELL_ABSORPTION")]
    SellAbsorption,
    #[display("DELTA_DIVERGENCE")]
    DeltaDivergence,
}

impl ImbalanceType {
    pub const ALL: [ImbalanceType; 5] = [
        ImbalanceType::BidStack,
        ImbalanceType::AskStack,
        ImbalanceType::BuyAbsorption,
        ImbalanceType::SellAbsorption,
        ImbalanceType::DeltaDivergence,
    ];

    /// Expected price direction once the imbalance plays out, `None` if it has none.
    ///
    /// Absorbed selling is bullish and absorbed buying bearish.
    pub fn bullish(&self) -> Option<bool> {
        match self {
            ImbalanceType::BidStack | ImbalanceType::SellAbsorption => Some(true),
            ImbalanceType::AskStack | ImbalanceType::BuyAbsorption => Some(false),
            ImbalanceType::DeltaDivergence => None,
        }
    }
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[display("LOW")]
    Low,
    #[display("MEDIUM")]
    Medium,
    #[display("HIGH")]
    High,
    #[display("EXTREME")]
    Extreme,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Extreme,
    ];

    /// Severity of a volume imbalance ratio, percent.
    pub fn from_ratio(ratio: Decimal) -> Self {
        match ratio.abs() {
            ratio if ratio > dec!(300) => Severity::Extreme,
            ratio if ratio > dec!(200) => Severity::High,
            ratio if ratio > dec!(100) => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    #[display("ABSORPTION")]
    Absorption,
    #[display("CONTINUATION")]
    Continuation,
    #[display("REVERSAL")]
    Reversal,
}

/// Order flow imbalance detected over a tick range.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderFlowImbalance {
    pub id: String,
    pub symbol: SmolStr,
    pub price: Decimal,
    pub imbalance_type: ImbalanceType,
    pub severity: Severity,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    /// Percent
    pub imbalance_ratio: Decimal,
    #[serde(with = "duration_millis")]
    pub duration: TimeDelta,
    pub is_active: bool,
    pub is_resolved: bool,
    pub resolution_type: Option<Resolution>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl OrderFlowImbalance {
    #[allow(clippy::too_many_arguments)]
    fn active(
        id: String,
        symbol: SmolStr,
        price: Decimal,
        imbalance_type: ImbalanceType,
        severity: Severity,
        (buy_volume, sell_volume): (Decimal, Decimal),
        imbalance_ratio: Decimal,
        (detected_at, until): (DateTime<Utc>, DateTime<Utc>),
    ) -> Self {
        Self {
            id,
            symbol,
            price,
            imbalance_type,
            severity,
            buy_volume,
            sell_volume,
            imbalance_ratio,
            duration: until - detected_at,
            is_active: true,
            is_resolved: false,
            resolution_type: None,
            detected_at,
            resolved_at: None,
        }
    }
}

/// Outcome statistics over resolved imbalances.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ResolutionStats {
    pub total_imbalances: usize,
    pub resolved_count: usize,
    /// Percent of all imbalances
    pub resolution_rate: Decimal,
    pub absorption_count: usize,
    pub continuation_count: usize,
    pub reversal_count: usize,
    pub avg_duration_ms: i64,
    /// Percent of resolved imbalances
    pub absorption_rate: Decimal,
    /// Percent of resolved imbalances
    pub continuation_rate: Decimal,
    /// Percent of resolved imbalances
    pub reversal_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ImbalanceSummary {
    pub total_imbalances: usize,
    pub active_count: usize,
    /// Percent
    pub active_rate: Decimal,
    pub severity_counts: IndexMap<Severity, usize>,
    pub type_counts: IndexMap<ImbalanceType, usize>,
}

/// Detects volume, stack, absorption and delta divergence imbalances.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImbalanceDetector;

impl ImbalanceDetector {
    pub fn new() -> Self {
        Self
    }

    /// Volume imbalances in ascending price order, then stacks, then absorptions.
    ///
    /// Ticks are sorted by timestamp first. Empty input yields no imbalances.
    pub fn detect_imbalances(
        &self,
        ticks: &[Tick],
        config: &OrderFlowConfig,
    ) -> Vec<OrderFlowImbalance> {
        let sorted = sorted_by_time(ticks);
        if sorted.is_empty() {
            return Vec::new();
        }

        let mut imbalances = volume_imbalances(&sorted, config);
        imbalances.extend(stack_imbalances(&sorted, config));
        imbalances.extend(absorptions(&sorted, config));

        debug!(
            symbol = %sorted[0].symbol,
            ticks = sorted.len(),
            imbalances = imbalances.len(),
            "detected imbalances"
        );

        imbalances
    }

    /// A single [`ImbalanceType::DeltaDivergence`] if the profile is divergent.
    pub fn detect_delta_divergences(&self, profile: &DeltaProfile) -> Vec<OrderFlowImbalance> {
        if !profile.is_divergent {
            return Vec::new();
        }

        let severity = if profile.delta_strength > DIVERGENCE_HIGH_STRENGTH {
            Severity::High
        } else {
            Severity::Medium
        };

        vec![OrderFlowImbalance::active(
            format!(
                "{}:divergence:{}",
                profile.symbol,
                profile.start_time.timestamp_millis()
            ),
            profile.symbol.clone(),
            Decimal::ZERO,
            ImbalanceType::DeltaDivergence,
            severity,
            (Decimal::ZERO, Decimal::ZERO),
            Decimal::ZERO,
            (profile.start_time, profile.end_time),
        )]
    }

    pub fn resolve(
        &self,
        imbalance: &mut OrderFlowImbalance,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) {
        imbalance.is_resolved = true;
        imbalance.is_active = false;
        imbalance.resolution_type = Some(resolution);
        imbalance.resolved_at = Some(at);
    }

    /// How an imbalance resolved given where price traded afterwards.
    ///
    /// Price holding at the imbalance level is [`Resolution::Absorption`]. Moving in the
    /// imbalance direction is [`Resolution::Continuation`], against it [`Resolution::Reversal`].
    pub fn classify_resolution(
        &self,
        imbalance: &OrderFlowImbalance,
        current_price: Decimal,
    ) -> Option<Resolution> {
        let bullish = imbalance.imbalance_type.bullish()?;

        Some(match current_price.cmp(&imbalance.price) {
            std::cmp::Ordering::Equal => Resolution::Absorption,
            std::cmp::Ordering::Greater if bullish => Resolution::Continuation,
            std::cmp::Ordering::Less if !bullish => Resolution::Continuation,
            _ => Resolution::Reversal,
        })
    }

    /// Active unresolved imbalances, most recently detected first.
    pub fn active_imbalances(&self, imbalances: &[OrderFlowImbalance]) -> Vec<OrderFlowImbalance> {
        let mut active = imbalances
            .iter()
            .filter(|imbalance| imbalance.is_active && !imbalance.is_resolved)
            .cloned()
            .collect::<Vec<_>>();

        active.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        active
    }

    pub fn resolution_stats(&self, imbalances: &[OrderFlowImbalance]) -> ResolutionStats {
        let resolved = imbalances
            .iter()
            .filter(|imbalance| imbalance.is_resolved)
            .collect::<Vec<_>>();

        let count = |resolution: Resolution| {
            resolved
                .iter()
                .filter(|imbalance| imbalance.resolution_type == Some(resolution))
                .count()
        };
        let absorption_count = count(Resolution::Absorption);
        let continuation_count = count(Resolution::Continuation);
        let reversal_count = count(Resolution::Reversal);

        let resolved_count = resolved.len();
        let avg_duration_ms = match i64::try_from(resolved_count) {
            Ok(count) if count > 0 => {
                resolved
                    .iter()
                    .map(|imbalance| imbalance.duration.num_milliseconds())
                    .sum::<i64>()
                    / count
            }
            _ => 0,
        };

        let of_resolved = |count: usize| {
            percentage(Decimal::from(count), Decimal::from(resolved_count))
        };

        ResolutionStats {
            total_imbalances: imbalances.len(),
            resolved_count,
            resolution_rate: percentage(
                Decimal::from(resolved_count),
                Decimal::from(imbalances.len()),
            ),
            absorption_count,
            continuation_count,
            reversal_count,
            avg_duration_ms,
            absorption_rate: of_resolved(absorption_count),
            continuation_rate: of_resolved(continuation_count),
            reversal_rate: of_resolved(reversal_count),
        }
    }

    pub fn imbalance_summary(&self, imbalances: &[OrderFlowImbalance]) -> ImbalanceSummary {
        let mut severity_counts = Severity::ALL
            .into_iter()
            .map(|severity| (severity, 0))
            .collect::<IndexMap<_, _>>();
        let mut type_counts = ImbalanceType::ALL
            .into_iter()
            .map(|kind| (kind, 0))
            .collect::<IndexMap<_, _>>();

        let mut active_count = 0;
        for imbalance in imbalances {
            if imbalance.is_active {
                active_count += 1;
            }
            *severity_counts.entry(imbalance.severity).or_default() += 1;
            *type_counts.entry(imbalance.imbalance_type).or_default() += 1;
        }

        ImbalanceSummary {
            total_imbalances: imbalances.len(),
            active_count,
            active_rate: percentage(
                Decimal::from(active_count),
                Decimal::from(imbalances.len()),
            ),
            severity_counts,
            type_counts,
        }
    }
}

#[derive(Debug)]
struct PriceLevel {
    buy_volume: Decimal,
    sell_volume: Decimal,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

fn volume_imbalances(ticks: &[&Tick], config: &OrderFlowConfig) -> Vec<OrderFlowImbalance> {
    let symbol = &ticks[0].symbol;

    let mut levels = BTreeMap::<Decimal, PriceLevel>::new();
    for tick in ticks {
        let level = levels
            .entry(round_to_tick(tick.price, config.price_tick_size))
            .or_insert_with(|| PriceLevel {
                buy_volume: Decimal::ZERO,
                sell_volume: Decimal::ZERO,
                first_seen: tick.timestamp,
                last_seen: tick.timestamp,
            });

        match tick.side {
            Side::Buy => level.buy_volume += tick.volume,
            Side::Sell => level.sell_volume += tick.volume,
        }
        level.last_seen = tick.timestamp;
    }

    levels
        .into_iter()
        .filter_map(|(price, level)| {
            if level.buy_volume + level.sell_volume < config.imbalance_min_volume {
                return None;
            }

            let (imbalance_type, ratio) = if level.sell_volume.is_zero() {
                if level.buy_volume.is_zero() {
                    return None;
                }
                (ImbalanceType::BidStack, Decimal::ONE_HUNDRED)
            } else {
                let ratio = (level.buy_volume.checked_div(level.sell_volume)? - Decimal::ONE)
                    * Decimal::ONE_HUNDRED;

                if ratio > config.imbalance_threshold {
                    (ImbalanceType::BidStack, ratio)
                } else if ratio < -config.imbalance_threshold {
                    (ImbalanceType::AskStack, -ratio)
                } else {
                    return None;
                }
            };

            Some(OrderFlowImbalance::active(
                format!("{symbol}:{imbalance_type}:{price}"),
                symbol.clone(),
                price,
                imbalance_type,
                Severity::from_ratio(ratio),
                (level.buy_volume, level.sell_volume),
                ratio,
                (level.first_seen, level.last_seen),
            ))
        })
        .collect()
}

/// Runs of at least [`STACK_MIN_TRADES`] consecutive same side trades near the run's first
/// price, scanning at most `2 × STACK_MIN_TRADES` trades from each start.
///
/// Identified by the first trade of the run, so a stack keeps its id as the window slides.
fn stack_imbalances(ticks: &[&Tick], config: &OrderFlowConfig) -> Vec<OrderFlowImbalance> {
    if ticks.len() < STACK_MIN_TRADES {
        return Vec::new();
    }

    (0..=ticks.len() - STACK_MIN_TRADES)
        .filter_map(|start| {
            let base = ticks[start];
            let tolerance = base.price * STACK_PRICE_TOLERANCE / Decimal::ONE_HUNDRED;

            let run = ticks[start..]
                .iter()
                .take(2 * STACK_MIN_TRADES)
                .take_while(|tick| {
                    tick.side == base.side && (tick.price - base.price).abs() <= tolerance
                })
                .collect::<Vec<_>>();

            let volume = run.iter().map(|tick| tick.volume).sum::<Decimal>();
            if run.len() < STACK_MIN_TRADES || volume < config.imbalance_min_volume {
                return None;
            }

            let (imbalance_type, volumes) = match base.side {
                Side::Buy => (ImbalanceType::BidStack, (volume, Decimal::ZERO)),
                Side::Sell => (ImbalanceType::AskStack, (Decimal::ZERO, volume)),
            };
            let severity = if run.len() >= STACK_HIGH_TRADES {
                Severity::High
            } else {
                Severity::Medium
            };
            let until = run.last().map_or(base.timestamp, |tick| tick.timestamp);

            Some(OrderFlowImbalance::active(
                format!("{}:stack:{}", base.symbol, base.id),
                base.symbol.clone(),
                base.price,
                imbalance_type,
                severity,
                volumes,
                Decimal::ONE_HUNDRED,
                (base.timestamp, until),
            ))
        })
        .collect()
}

/// Sliding windows of [`ABSORPTION_WINDOW`] trades with heavy volume and a tight price range,
/// identified by the first trade of the window.
fn absorptions(ticks: &[&Tick], config: &OrderFlowConfig) -> Vec<OrderFlowImbalance> {
    let min_volume = config.imbalance_min_volume * Decimal::TWO;
    let high_volume = config.imbalance_min_volume * dec!(5);

    ticks
        .windows(ABSORPTION_WINDOW)
        .filter_map(|window| {
            let low = window.iter().map(|tick| tick.price).min()?;
            let high = window.iter().map(|tick| tick.price).max()?;
            let mid = (low + high) / Decimal::TWO;
            if mid.is_zero() {
                return None;
            }

            let (buy_volume, sell_volume) = side_volumes(window.iter().copied());
            let total = buy_volume + sell_volume;
            let range = percentage(high - low, mid);
            if range > ABSORPTION_MAX_RANGE || total < min_volume {
                return None;
            }

            let (imbalance_type, dominant) = if buy_volume > sell_volume {
                (ImbalanceType::BuyAbsorption, buy_volume)
            } else {
                (ImbalanceType::SellAbsorption, sell_volume)
            };
            let severity = if total > high_volume {
                Severity::High
            } else {
                Severity::Medium
            };

            let first = window.first()?;
            let last = window.last()?;

            Some(OrderFlowImbalance::active(
                format!("{}:absorption:{}", first.symbol, first.id),
                first.symbol.clone(),
                mid,
                imbalance_type,
                severity,
                (buy_volume, sell_volume),
                percentage(dominant, total),
                (first.timestamp, last.timestamp),
            ))
        })
        .collect()
}

/// Serialise a [`TimeDelta`] as whole milliseconds.
mod duration_millis {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_milliseconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TimeDelta, D::Error>
    where
        D: Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(TimeDelta::milliseconds)
    }
}
