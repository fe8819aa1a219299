use crate::{
    aggregation::{percentage, round_to_tick, sorted_by_time},
    config::OrderFlowConfig,
    error::AnalysisError,
};
use chrono::{DateTime, Timelike, Utc};
use derive_more::Display;
use orderflow_data::tick::{Side, Tick};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::debug;

/// Volume profile over a visible range.
pub const PROFILE_VPVR: &str = "VPVR";

/// Volume distribution across price levels over a time range.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct VolumeProfile {
    /// `{symbol}:{profile_type}:{start_ms}:{end_ms}`
    pub id: String,
    pub symbol: SmolStr,
    pub profile_type: SmolStr,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub total_volume: Decimal,
    pub point_of_control: Decimal,
    pub value_area_high: Decimal,
    pub value_area_low: Decimal,
    pub value_area_volume: Decimal,
    /// Ascending by price.
    pub price_levels: Vec<VolumeProfileLevel>,
}

impl VolumeProfile {
    fn empty(symbol: SmolStr, profile_type: SmolStr) -> Self {
        Self {
            symbol,
            profile_type,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.price_levels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct VolumeProfileLevel {
    pub price: Decimal,
    pub volume: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub delta: Decimal,
    pub trade_count: usize,
    /// Share of the profile total volume, percent
    pub percentage: Decimal,
    pub is_poc: bool,
    pub is_value_area: bool,
    pub is_hvn: bool,
    pub is_lvn: bool,
}

/// UTC time of day trading sessions, start hour inclusive and end hour exclusive.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingSession {
    #[display("ASIAN")]
    Asian,
    #[display("LONDON")]
    London,
    #[display("NEW_YORK")]
    NewYork,
    #[display("LONDON_NY_OVERLAP")]
    LondonNyOverlap,
}

impl TradingSession {
    pub const ALL: [TradingSession; 4] = [
        TradingSession::Asian,
        TradingSession::London,
        TradingSession::NewYork,
        TradingSession::LondonNyOverlap,
    ];

    /// Case insensitive lookup by [`TradingSession::label`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|session| session.label().eq_ignore_ascii_case(name))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TradingSession::Asian => "ASIAN",
            TradingSession::London => "LONDON",
            TradingSession::NewYork => "NEW_YORK",
            TradingSession::LondonNyOverlap => "LONDON_NY_OVERLAP",
        }
    }

    /// `(start_hour, end_hour)` in UTC.
    pub fn hours(&self) -> (u32, u32) {
        match self {
            TradingSession::Asian => (0, 9),
            TradingSession::London => (8, 17),
            TradingSession::NewYork => (13, 22),
            TradingSession::LondonNyOverlap => (13, 17),
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        let (start, end) = self.hours();
        (start..end).contains(&time.hour())
    }
}

#[derive(Debug, Default)]
struct LevelAccumulator {
    buy_volume: Decimal,
    sell_volume: Decimal,
    trade_count: usize,
}

/// Builds [`VolumeProfile`]s from trade ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeProfiler;

impl VolumeProfiler {
    pub fn new() -> Self {
        Self
    }

    /// Profile every tick in `ticks`. Empty input yields an empty profile.
    pub fn generate_volume_profile(
        &self,
        ticks: &[Tick],
        profile_type: &str,
        config: &OrderFlowConfig,
    ) -> Result<VolumeProfile, AnalysisError> {
        config.validate()?;

        let sorted = sorted_by_time(ticks);
        let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
            return Ok(VolumeProfile::empty(
                config.symbol.clone(),
                SmolStr::new(profile_type),
            ));
        };

        let mut accumulators = BTreeMap::<Decimal, LevelAccumulator>::new();
        for tick in &sorted {
            let level = accumulators
                .entry(round_to_tick(tick.price, config.price_tick_size))
                .or_default();

            match tick.side {
                Side::Buy => level.buy_volume += tick.volume,
                Side::Sell => level.sell_volume += tick.volume,
            }
            level.trade_count += 1;
        }

        let total_volume = sorted.iter().map(|tick| tick.volume).sum::<Decimal>();
        let high_price = sorted.iter().map(|tick| tick.price).max().unwrap_or_default();
        let low_price = sorted.iter().map(|tick| tick.price).min().unwrap_or_default();

        let mut levels = accumulators
            .into_iter()
            .map(|(price, level)| {
                let volume = level.buy_volume + level.sell_volume;
                VolumeProfileLevel {
                    price,
                    volume,
                    buy_volume: level.buy_volume,
                    sell_volume: level.sell_volume,
                    delta: level.buy_volume - level.sell_volume,
                    trade_count: level.trade_count,
                    percentage: percentage(volume, total_volume),
                    ..Default::default()
                }
            })
            .collect::<Vec<_>>();

        let poc_index = point_of_control_index(&levels);
        levels[poc_index].is_poc = true;

        let target = total_volume * config.value_area_percentage / Decimal::ONE_HUNDRED;
        let (low_index, high_index, value_area_volume) =
            expand_value_area(&levels, poc_index, target);
        levels[low_index..=high_index]
            .iter_mut()
            .for_each(|level| level.is_value_area = true);

        mark_volume_nodes(&mut levels, config);

        let symbol = first.symbol.clone();
        let profile = VolumeProfile {
            id: format!(
                "{symbol}:{profile_type}:{}:{}",
                first.timestamp.timestamp_millis(),
                last.timestamp.timestamp_millis()
            ),
            symbol,
            profile_type: SmolStr::new(profile_type),
            start_time: first.timestamp,
            end_time: last.timestamp,
            high_price,
            low_price,
            total_volume,
            point_of_control: levels[poc_index].price,
            value_area_high: levels[high_index].price,
            value_area_low: levels[low_index].price,
            value_area_volume,
            price_levels: levels,
        };

        debug!(
            symbol = %profile.symbol,
            profile_type,
            levels = profile.price_levels.len(),
            poc = %profile.point_of_control,
            "generated volume profile"
        );

        Ok(profile)
    }

    /// Profile the ticks falling inside the named [`TradingSession`].
    ///
    /// Unknown session names include every tick. The resulting `profile_type` is the session
    /// name as provided.
    pub fn generate_session_profile(
        &self,
        ticks: &[Tick],
        session: &str,
        config: &OrderFlowConfig,
    ) -> Result<VolumeProfile, AnalysisError> {
        let in_session = match TradingSession::from_name(session) {
            Some(session) => ticks
                .iter()
                .filter(|tick| session.contains(tick.timestamp))
                .cloned()
                .collect::<Vec<_>>(),
            None => ticks.to_vec(),
        };

        self.generate_volume_profile(&in_session, session, config)
    }

    /// Key levels derived from a profile as `(support, resistance)`.
    ///
    /// High volume node local maxima below the POC are support and above are resistance.
    /// The POC is then added to both, the value area low to support and the value area high
    /// to resistance.
    pub fn support_resistance(&self, profile: &VolumeProfile) -> (Vec<Decimal>, Vec<Decimal>) {
        let mut support = Vec::new();
        let mut resistance = Vec::new();

        if profile.is_empty() {
            return (support, resistance);
        }

        let levels = &profile.price_levels;
        for (index, level) in levels.iter().enumerate() {
            if !level.is_hvn {
                continue;
            }

            let above_previous = index == 0 || level.volume >= levels[index - 1].volume;
            let above_next = levels
                .get(index + 1)
                .is_none_or(|next| level.volume >= next.volume);
            if !(above_previous && above_next) {
                continue;
            }

            if level.price < profile.point_of_control {
                support.push(level.price);
            } else if level.price > profile.point_of_control {
                resistance.push(level.price);
            }
        }

        support.push(profile.point_of_control);
        resistance.push(profile.point_of_control);
        support.push(profile.value_area_low);
        resistance.push(profile.value_area_high);

        (support, resistance)
    }
}

/// Index of the level with the largest volume, lowest price on ties.
fn point_of_control_index(levels: &[VolumeProfileLevel]) -> usize {
    levels
        .iter()
        .enumerate()
        .fold((0, Decimal::MIN), |(best, best_volume), (index, level)| {
            if level.volume > best_volume {
                (index, level.volume)
            } else {
                (best, best_volume)
            }
        })
        .0
}

/// Grow the value area outwards from the POC one level at a time, taking whichever adjacent
/// level has more volume (lower level on ties), until `target` is reached.
///
/// Returns `(low_index, high_index, value_area_volume)`.
fn expand_value_area(
    levels: &[VolumeProfileLevel],
    poc_index: usize,
    target: Decimal,
) -> (usize, usize, Decimal) {
    let mut low = poc_index;
    let mut high = poc_index;
    let mut volume = levels[poc_index].volume;

    while volume < target {
        let below = low.checked_sub(1).map(|index| levels[index].volume);
        let above = levels.get(high + 1).map(|level| level.volume);

        match (below, above) {
            (Some(down), Some(up)) if down >= up => {
                low -= 1;
                volume += down;
            }
            (_, Some(up)) => {
                high += 1;
                volume += up;
            }
            (Some(down), None) => {
                low -= 1;
                volume += down;
            }
            (None, None) => break,
        }
    }

    (low, high, volume)
}

fn mark_volume_nodes(levels: &mut [VolumeProfileLevel], config: &OrderFlowConfig) {
    let total = levels.iter().map(|level| level.volume).sum::<Decimal>();
    let Some(mean) = total.checked_div(Decimal::from(levels.len())) else {
        return;
    };

    let hvn = mean * config.hvn_threshold;
    let lvn = mean * config.lvn_threshold;

    for level in levels {
        if level.volume >= hvn {
            level.is_hvn = true;
        } else if level.volume <= lvn {
            level.is_lvn = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow_data::exchange::ExchangeId;
    use rust_decimal_macros::dec;

    fn tick(time: DateTime<Utc>, price: Decimal, volume: Decimal, side: Side) -> Tick {
        Tick {
            id: format!("binance_{}", time.timestamp()),
            symbol: SmolStr::new_static("BTCUSDT"),
            price,
            volume,
            side,
            exchange: ExchangeId::Binance,
            timestamp: time,
            is_aggressor: true,
            sequence: time.timestamp() as u64,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_006_400, 0)
            .unwrap()
            .with_hour(hour)
            .unwrap()
            .with_minute(minute)
            .unwrap()
    }

    fn levels(volumes: &[(Decimal, Decimal)]) -> Vec<Tick> {
        volumes
            .iter()
            .enumerate()
            .map(|(index, (price, volume))| {
                tick(at(10, index as u32), *price, *volume, Side::Buy)
            })
            .collect()
    }

    fn config() -> OrderFlowConfig {
        OrderFlowConfig::new("BTCUSDT").with_price_tick_size(dec!(1))
    }

    #[test]
    fn test_single_level_profile() {
        let ticks = vec![tick(at(10, 0), dec!(100), dec!(3), Side::Buy)];

        let profile = VolumeProfiler
            .generate_volume_profile(&ticks, PROFILE_VPVR, &config())
            .unwrap();

        assert_eq!(profile.price_levels.len(), 1);
        assert_eq!(profile.point_of_control, dec!(100));
        assert_eq!(profile.value_area_high, dec!(100));
        assert_eq!(profile.value_area_low, dec!(100));
        assert_eq!(profile.value_area_volume, dec!(3));
        assert_eq!(profile.price_levels[0].percentage, dec!(100));
        assert!(profile.price_levels[0].is_poc);
        assert!(profile.price_levels[0].is_value_area);
        assert_eq!(
            profile.id,
            format!(
                "BTCUSDT:VPVR:{}:{}",
                at(10, 0).timestamp_millis(),
                at(10, 0).timestamp_millis()
            )
        );
    }

    #[test]
    fn test_empty_profile() {
        let profile = VolumeProfiler
            .generate_volume_profile(&[], PROFILE_VPVR, &config())
            .unwrap();

        assert!(profile.is_empty());
        assert_eq!(profile.total_volume, dec!(0));
        assert_eq!(profile.symbol, "BTCUSDT");
        assert_eq!(profile.profile_type, PROFILE_VPVR);
    }

    #[test]
    fn test_value_area_expansion() {
        struct TestCase {
            volumes: Vec<(Decimal, Decimal)>,
            value_area_percentage: Decimal,
            expected_poc: Decimal,
            expected_val: Decimal,
            expected_vah: Decimal,
            expected_volume: Decimal,
        }

        let tests = vec![
            TestCase {
                // TC0: expands towards the larger neighbour
                volumes: vec![
                    (dec!(100), dec!(1)),
                    (dec!(101), dec!(2)),
                    (dec!(102), dec!(10)),
                    (dec!(103), dec!(5)),
                    (dec!(104), dec!(2)),
                ],
                value_area_percentage: dec!(70),
                expected_poc: dec!(102),
                expected_val: dec!(102),
                expected_vah: dec!(103),
                expected_volume: dec!(15),
            },
            TestCase {
                // TC1: lower neighbour wins ties
                volumes: vec![
                    (dec!(100), dec!(3)),
                    (dec!(101), dec!(10)),
                    (dec!(102), dec!(3)),
                ],
                value_area_percentage: dec!(70),
                expected_poc: dec!(101),
                expected_val: dec!(100),
                expected_vah: dec!(101),
                expected_volume: dec!(13),
            },
            TestCase {
                // TC2: POC tie resolves to the lower price
                volumes: vec![(dec!(100), dec!(5)), (dec!(101), dec!(5))],
                value_area_percentage: dec!(40),
                expected_poc: dec!(100),
                expected_val: dec!(100),
                expected_vah: dec!(100),
                expected_volume: dec!(5),
            },
            TestCase {
                // TC3: full value area covers every level
                volumes: vec![
                    (dec!(100), dec!(1)),
                    (dec!(101), dec!(4)),
                    (dec!(102), dec!(1)),
                ],
                value_area_percentage: dec!(100),
                expected_poc: dec!(101),
                expected_val: dec!(100),
                expected_vah: dec!(102),
                expected_volume: dec!(6),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let config = config().with_value_area_percentage(test.value_area_percentage);
            let profile = VolumeProfiler
                .generate_volume_profile(&levels(&test.volumes), PROFILE_VPVR, &config)
                .unwrap();

            assert_eq!(profile.point_of_control, test.expected_poc, "TC{} failed", index);
            assert_eq!(profile.value_area_low, test.expected_val, "TC{} failed", index);
            assert_eq!(profile.value_area_high, test.expected_vah, "TC{} failed", index);
            assert_eq!(
                profile.value_area_volume, test.expected_volume,
                "TC{} failed",
                index
            );
            assert_eq!(
                profile.price_levels.iter().filter(|level| level.is_poc).count(),
                1,
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_volume_nodes() {
        // mean volume 4, HVN >= 6, LVN <= 2
        let ticks = levels(&[
            (dec!(100), dec!(2)),
            (dec!(101), dec!(8)),
            (dec!(102), dec!(3)),
            (dec!(103), dec!(3)),
        ]);

        let profile = VolumeProfiler
            .generate_volume_profile(&ticks, PROFILE_VPVR, &config())
            .unwrap();

        let nodes = profile
            .price_levels
            .iter()
            .map(|level| (level.is_hvn, level.is_lvn))
            .collect::<Vec<_>>();
        assert_eq!(
            nodes,
            vec![(false, true), (true, false), (false, false), (false, false)]
        );
    }

    #[test]
    fn test_level_side_split() {
        let ticks = vec![
            tick(at(10, 0), dec!(100.2), dec!(3), Side::Buy),
            tick(at(10, 1), dec!(99.9), dec!(1), Side::Sell),
        ];

        let profile = VolumeProfiler
            .generate_volume_profile(&ticks, PROFILE_VPVR, &config())
            .unwrap();
        let level = &profile.price_levels[0];

        assert_eq!(profile.price_levels.len(), 1);
        assert_eq!(level.buy_volume, dec!(3));
        assert_eq!(level.sell_volume, dec!(1));
        assert_eq!(level.delta, dec!(2));
        assert_eq!(level.trade_count, 2);
        assert_eq!(profile.high_price, dec!(100.2));
        assert_eq!(profile.low_price, dec!(99.9));
    }

    #[test]
    fn test_session_profile_filters_by_hour() {
        struct TestCase {
            session: &'static str,
            expected_volume: Decimal,
        }

        let ticks = vec![
            tick(at(1, 0), dec!(100), dec!(1), Side::Buy),
            tick(at(8, 30), dec!(100), dec!(2), Side::Buy),
            tick(at(14, 0), dec!(100), dec!(4), Side::Buy),
            tick(at(17, 0), dec!(100), dec!(8), Side::Buy),
            tick(at(22, 0), dec!(100), dec!(16), Side::Buy),
        ];

        let tests = vec![
            TestCase {
                // TC0: ASIAN includes 01:00 and 08:30
                session: "ASIAN",
                expected_volume: dec!(3),
            },
            TestCase {
                // TC1: LONDON includes 08:30 and 14:00, excludes 17:00
                session: "LONDON",
                expected_volume: dec!(6),
            },
            TestCase {
                // TC2: NEW_YORK includes 14:00 and 17:00, excludes 22:00
                session: "NEW_YORK",
                expected_volume: dec!(12),
            },
            TestCase {
                // TC3: overlap only includes 14:00
                session: "london_ny_overlap",
                expected_volume: dec!(4),
            },
            TestCase {
                // TC4: unknown session includes everything
                session: "SYDNEY",
                expected_volume: dec!(31),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let profile = VolumeProfiler
                .generate_session_profile(&ticks, test.session, &config())
                .unwrap();
            assert_eq!(profile.total_volume, test.expected_volume, "TC{} failed", index);
            assert_eq!(profile.profile_type, test.session, "TC{} failed", index);
        }
    }

    #[test]
    fn test_support_resistance() {
        // mean 4, HVN >= 6: 100 (local max) below POC and 104 above
        let ticks = levels(&[
            (dec!(100), dec!(6)),
            (dec!(101), dec!(1)),
            (dec!(102), dec!(10)),
            (dec!(103), dec!(1)),
            (dec!(104), dec!(6)),
            (dec!(105), dec!(0)),
        ]);

        let profile = VolumeProfiler
            .generate_volume_profile(&ticks, PROFILE_VPVR, &config())
            .unwrap();
        let (support, resistance) = VolumeProfiler.support_resistance(&profile);

        assert_eq!(
            support,
            vec![dec!(100), dec!(102), profile.value_area_low]
        );
        assert_eq!(
            resistance,
            vec![dec!(104), dec!(102), profile.value_area_high]
        );

        let empty = VolumeProfile::default();
        assert_eq!(
            VolumeProfiler.support_resistance(&empty),
            (Vec::new(), Vec::new())
        );
    }
}
