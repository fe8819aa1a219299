//! Aggregation helpers shared by every analyser.
use itertools::Itertools;
use orderflow_data::tick::Tick;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round `price` to the nearest multiple of `tick_size`, midpoint away from zero.
///
/// A zero tick size leaves the price unrounded.
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }

    match price.checked_div(tick_size) {
        Some(steps) => {
            (steps.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * tick_size)
                .normalize()
        }
        None => price,
    }
}

/// `part / total × 100`, zero when `total` is zero.
pub fn percentage(part: Decimal, total: Decimal) -> Decimal {
    if total.is_zero() {
        return Decimal::ZERO;
    }

    part.checked_div(total)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO)
}

/// Private copy of `ticks` stable sorted ascending by timestamp.
pub fn sorted_by_time(ticks: &[Tick]) -> Vec<&Tick> {
    ticks.iter().sorted_by_key(|tick| tick.timestamp).collect()
}

/// Buy and sell volume of `ticks`.
pub fn side_volumes<'a>(ticks: impl IntoIterator<Item = &'a Tick>) -> (Decimal, Decimal) {
    ticks
        .into_iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(buy, sell), tick| {
            if tick.side.is_buy() {
                (buy + tick.volume, sell)
            } else {
                (buy, sell + tick.volume)
            }
        })
}
