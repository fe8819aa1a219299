use orderflow_data::{
    collector::{CollectorConfig, ExchangeSubscription, TickCollector},
    exchange::ExchangeId,
};
use orderflow_server::{OrderFlowService, OrderFlowUpdate, ServiceConfig};
use smol_str::SmolStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting order flow service");

    // Comma separated, symbols containing '-' are routed to Coinbase and the rest to Binance
    let symbols = std::env::var("ORDERFLOW_SYMBOLS")
        .unwrap_or_else(|_| "BTCUSDT,ETHUSDT,BTC-USD".to_string());
    let subscriptions = exchange_subscriptions(&symbols);

    let reconnect_secs = std::env::var("ORDERFLOW_RECONNECT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let buffer_size = std::env::var("ORDERFLOW_BUFFER_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1_000);

    info!(
        reconnect_secs,
        buffer_size,
        ?subscriptions,
        "order flow configuration"
    );

    let collector = match TickCollector::in_memory(
        CollectorConfig::new(subscriptions)
            .with_reconnect_delay(Duration::from_secs(reconnect_secs))
            .with_channel_buffer_size(buffer_size),
    ) {
        Ok(collector) => collector,
        Err(error) => {
            error!(%error, "failed to construct TickCollector");
            return;
        }
    };

    let service = OrderFlowService::new(
        ServiceConfig::default().with_subscriber_capacity(buffer_size),
        collector,
    );

    for symbol in service.symbols() {
        let mut updates = service.subscribe_to_order_flow(symbol.clone());
        tokio::spawn(async move {
            while let Some(message) = updates.recv().await {
                match message.update {
                    OrderFlowUpdate::Metrics(metrics) => debug!(
                        symbol = %message.symbol,
                        price = %metrics.current_price,
                        cumulative_delta = %metrics.cumulative_delta,
                        buy_pressure = %metrics.buy_pressure,
                        "metrics"
                    ),
                    OrderFlowUpdate::Imbalances { active } => info!(
                        symbol = %message.symbol,
                        active = active.len(),
                        "active imbalances"
                    ),
                    update => debug!(symbol = %message.symbol, kind = update.label(), "update"),
                }
            }
        });
    }

    let cancel = CancellationToken::new();
    if let Err(error) = service.start(&cancel) {
        error!(%error, "failed to start OrderFlowService");
        return;
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
    }

    info!("Shutting down");
    cancel.cancel();
    service.stop().await;
}

fn exchange_subscriptions(symbols: &str) -> Vec<ExchangeSubscription> {
    let (coinbase, binance): (Vec<SmolStr>, Vec<SmolStr>) = symbols
        .split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(SmolStr::new)
        .partition(|symbol| symbol.contains('-'));

    [(ExchangeId::Binance, binance), (ExchangeId::Coinbase, coinbase)]
        .into_iter()
        .filter(|(_, symbols)| !symbols.is_empty())
        .map(|(exchange, symbols)| ExchangeSubscription::new(exchange, symbols))
        .collect()
}

/// Filter used when `ORDERFLOW_LOG` is unset: workspace crates at `info`, dependencies at `warn`.
const DEFAULT_LOG_FILTER: &str =
    "warn,orderflow_data=info,orderflow_analysis=info,orderflow_server=info";

/// Initialize logging, filtered by `ORDERFLOW_LOG` (`EnvFilter` directives).
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ORDERFLOW_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
