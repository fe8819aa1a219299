use chrono::{DateTime, Utc};
use orderflow_analysis::{
    DeltaProfile, DeltaSignal, FootprintBar, OrderFlowConfig, OrderFlowImbalance, VolumeProfile,
    delta::{DeltaHistorySummary, DeltaSummary},
    imbalance::{ImbalanceSummary, ResolutionStats},
};
use orderflow_data::tick::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct FootprintMetadata {
    pub tick_count: usize,
    pub bar_count: usize,
    /// Distinct price levels across every bar
    pub price_levels: usize,
    pub total_volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FootprintChartData {
    pub symbol: SmolStr,
    pub timeframe: SmolStr,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bars: Vec<FootprintBar>,
    pub config: OrderFlowConfig,
    pub metadata: FootprintMetadata,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ProfileMetadata {
    pub tick_count: usize,
    pub price_levels: usize,
    pub total_volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VolumeProfileChartData {
    pub symbol: SmolStr,
    pub profile_type: SmolStr,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub profile: VolumeProfile,
    pub support: Vec<Decimal>,
    pub resistance: Vec<Decimal>,
    pub config: OrderFlowConfig,
    pub metadata: ProfileMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeltaAnalysisData {
    pub symbol: SmolStr,
    pub timeframe: SmolStr,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub delta_profile: DeltaProfile,
    pub summary: DeltaSummary,
    /// One profile per `time_per_row` bucket, oldest first
    pub delta_history: Vec<DeltaProfile>,
    pub history_summary: DeltaHistorySummary,
    pub divergences: Vec<OrderFlowImbalance>,
    pub signals: Vec<DeltaSignal>,
    pub config: OrderFlowConfig,
}

/// Latest order flow state of one symbol, maintained from the live tick stream.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct OrderFlowMetrics {
    pub symbol: SmolStr,
    pub timestamp: DateTime<Utc>,
    pub current_price: Decimal,
    /// Price of the most recent sell aggressor trade
    pub bid_price: Decimal,
    /// Price of the most recent buy aggressor trade
    pub ask_price: Decimal,
    pub last_trade_volume: Decimal,
    pub last_trade_side: Option<Side>,
    /// Since the service started
    pub cumulative_delta: Decimal,
    /// Since the start of the current UTC day
    pub session_delta: Decimal,
    pub buy_pressure: Decimal,
    pub sell_pressure: Decimal,
    pub active_imbalances: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ImbalanceStats {
    pub summary: ImbalanceSummary,
    pub resolution: ResolutionStats,
}

/// Result published to order flow subscribers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderFlowMessage {
    pub symbol: SmolStr,
    pub timestamp: DateTime<Utc>,
    pub update: OrderFlowUpdate,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderFlowUpdate {
    Metrics(OrderFlowMetrics),
    Footprint {
        bars: Vec<FootprintBar>,
    },
    Delta {
        profile: DeltaProfile,
        signals: Vec<DeltaSignal>,
    },
    Imbalances {
        active: Vec<OrderFlowImbalance>,
    },
}

impl OrderFlowUpdate {
    pub fn label(&self) -> &'static str {
        match self {
            OrderFlowUpdate::Metrics(_) => "metrics",
            OrderFlowUpdate::Footprint { .. } => "footprint",
            OrderFlowUpdate::Delta { .. } => "delta",
            OrderFlowUpdate::Imbalances { .. } => "imbalances",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_flow_message_serde() {
        let message = OrderFlowMessage {
            symbol: SmolStr::new_static("BTCUSDT"),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            update: OrderFlowUpdate::Metrics(OrderFlowMetrics {
                symbol: SmolStr::new_static("BTCUSDT"),
                current_price: dec!(100.5),
                last_trade_side: Some(Side::Buy),
                ..Default::default()
            }),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["update"]["type"], "metrics");
        assert_eq!(json["update"]["current_price"], "100.5");
        assert_eq!(json["update"]["last_trade_side"], "BUY");

        let decoded: OrderFlowMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_update_label() {
        let update = OrderFlowUpdate::Imbalances { active: Vec::new() };
        assert_eq!(update.label(), "imbalances");

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "imbalances");
    }
}
