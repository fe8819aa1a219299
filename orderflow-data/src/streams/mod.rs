/// Idle read watchdog for exchange WebSocket streams.
pub mod timeout;
