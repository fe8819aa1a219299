use crate::error::AnalysisError;
use derive_more::Display;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{str::FromStr, time::Duration};

/// How ticks are grouped into footprint rows.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationMethod {
    /// Fixed wall clock rows of `time_per_row`.
    #[default]
    #[display("TIME")]
    Time,
    /// Rows sealed once `volume_per_row` has traded.
    #[display("VOLUME")]
    Volume,
    /// Rows sealed once `ticks_per_row` ticks have been processed.
    #[display("TICK_COUNT")]
    TickCount,
}

impl AggregationMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AggregationMethod::Time => "TIME",
            AggregationMethod::Volume => "VOLUME",
            AggregationMethod::TickCount => "TICK_COUNT",
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = AnalysisError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "TIME" => Ok(AggregationMethod::Time),
            "VOLUME" => Ok(AggregationMethod::Volume),
            "TICK_COUNT" => Ok(AggregationMethod::TickCount),
            _ => Err(AnalysisError::UnsupportedAggregation(input.to_string())),
        }
    }
}

/// Per request analysis parameters. Never persisted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrderFlowConfig {
    pub symbol: SmolStr,
    pub tick_aggregation_method: AggregationMethod,
    #[serde(with = "duration_secs")]
    pub time_per_row: Duration,
    pub volume_per_row: Decimal,
    pub ticks_per_row: usize,
    /// Price rounding granularity, zero disables rounding
    pub price_tick_size: Decimal,
    /// Percent
    pub imbalance_threshold: Decimal,
    pub imbalance_min_volume: Decimal,
    /// Percent of total volume contained in the value area
    pub value_area_percentage: Decimal,
    /// Multiple of the mean level volume
    pub hvn_threshold: Decimal,
    /// Multiple of the mean level volume
    pub lvn_threshold: Decimal,
    pub delta_smoothing_period: usize,
    pub enable_real_time_updates: bool,
    pub enable_imbalance_detection: bool,
    pub enable_delta_divergence: bool,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        Self {
            symbol: SmolStr::default(),
            tick_aggregation_method: AggregationMethod::Time,
            time_per_row: Duration::from_secs(60),
            volume_per_row: dec!(100),
            ticks_per_row: 100,
            price_tick_size: dec!(0.01),
            imbalance_threshold: dec!(70),
            imbalance_min_volume: Decimal::ZERO,
            value_area_percentage: dec!(70),
            hvn_threshold: dec!(1.5),
            lvn_threshold: dec!(0.5),
            delta_smoothing_period: 10,
            enable_real_time_updates: true,
            enable_imbalance_detection: true,
            enable_delta_divergence: true,
        }
    }
}

impl OrderFlowConfig {
    pub fn new(symbol: impl Into<SmolStr>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn with_aggregation(mut self, method: AggregationMethod) -> Self {
        self.tick_aggregation_method = method;
        self
    }

    pub fn with_time_per_row(mut self, time_per_row: Duration) -> Self {
        self.time_per_row = time_per_row;
        self
    }

    pub fn with_volume_per_row(mut self, volume_per_row: Decimal) -> Self {
        self.volume_per_row = volume_per_row;
        self
    }

    pub fn with_ticks_per_row(mut self, ticks_per_row: usize) -> Self {
        self.ticks_per_row = ticks_per_row;
        self
    }

    pub fn with_price_tick_size(mut self, tick_size: Decimal) -> Self {
        self.price_tick_size = tick_size;
        self
    }

    pub fn with_imbalance(mut self, threshold: Decimal, min_volume: Decimal) -> Self {
        self.imbalance_threshold = threshold;
        self.imbalance_min_volume = min_volume;
        self
    }

    pub fn with_value_area_percentage(mut self, percentage: Decimal) -> Self {
        self.value_area_percentage = percentage;
        self
    }

    pub fn with_volume_nodes(mut self, hvn_threshold: Decimal, lvn_threshold: Decimal) -> Self {
        self.hvn_threshold = hvn_threshold;
        self.lvn_threshold = lvn_threshold;
        self
    }

    pub fn with_delta_smoothing_period(mut self, period: usize) -> Self {
        self.delta_smoothing_period = period;
        self
    }

    /// Validate the parameters shared by every aggregator.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.price_tick_size.is_sign_negative() {
            return Err(AnalysisError::InvalidConfig(format!(
                "price_tick_size must not be negative: {}",
                self.price_tick_size
            )));
        }

        if self.value_area_percentage < Decimal::ZERO
            || self.value_area_percentage > Decimal::ONE_HUNDRED
        {
            return Err(AnalysisError::InvalidConfig(format!(
                "value_area_percentage must be within [0, 100]: {}",
                self.value_area_percentage
            )));
        }

        Ok(())
    }
}

/// Serialise a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_method_from_str() {
        struct TestCase {
            input: &'static str,
            expected: Result<AggregationMethod, AnalysisError>,
        }

        let tests = vec![
            TestCase {
                // TC0: TIME
                input: "TIME",
                expected: Ok(AggregationMethod::Time),
            },
            TestCase {
                // TC1: VOLUME
                input: "VOLUME",
                expected: Ok(AggregationMethod::Volume),
            },
            TestCase {
                // TC2: TICK_COUNT in lowercase
                input: "tick_count",
                expected: Ok(AggregationMethod::TickCount),
            },
            TestCase {
                // TC3: unknown method
                input: "RANGE",
                expected: Err(AnalysisError::UnsupportedAggregation("RANGE".to_string())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.parse::<AggregationMethod>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_default_config() {
        let config = OrderFlowConfig::default();
        assert_eq!(config.tick_aggregation_method, AggregationMethod::Time);
        assert_eq!(config.time_per_row, Duration::from_secs(60));
        assert_eq!(config.value_area_percentage, dec!(70));
        assert_eq!(config.hvn_threshold, dec!(1.5));
        assert_eq!(config.lvn_threshold, dec!(0.5));
        assert_eq!(config.delta_smoothing_period, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = OrderFlowConfig::new("BTCUSDT")
            .with_aggregation(AggregationMethod::Volume)
            .with_volume_per_row(dec!(5))
            .with_price_tick_size(dec!(0.5))
            .with_imbalance(dec!(150), dec!(10))
            .with_value_area_percentage(dec!(68))
            .with_delta_smoothing_period(4);

        assert_eq!(config.symbol, "BTCUSDT");
        assert_eq!(config.tick_aggregation_method, AggregationMethod::Volume);
        assert_eq!(config.volume_per_row, dec!(5));
        assert_eq!(config.price_tick_size, dec!(0.5));
        assert_eq!(config.imbalance_threshold, dec!(150));
        assert_eq!(config.imbalance_min_volume, dec!(10));
        assert_eq!(config.value_area_percentage, dec!(68));
        assert_eq!(config.delta_smoothing_period, 4);
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            OrderFlowConfig::default()
                .with_price_tick_size(dec!(-1))
                .validate(),
            Err(AnalysisError::InvalidConfig(_))
        ));
        assert!(matches!(
            OrderFlowConfig::default()
                .with_value_area_percentage(dec!(101))
                .validate(),
            Err(AnalysisError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_serde() {
        let config = OrderFlowConfig::new("ETHUSDT").with_aggregation(AggregationMethod::TickCount);
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["tick_aggregation_method"], "TICK_COUNT");
        assert_eq!(json["time_per_row"], 60);

        let partial: OrderFlowConfig =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","time_per_row":3600}"#).unwrap();
        assert_eq!(partial.symbol, "BTCUSDT");
        assert_eq!(partial.time_per_row, Duration::from_secs(3600));
        assert_eq!(partial.price_tick_size, dec!(0.01));
    }
}
