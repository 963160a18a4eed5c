//! Metric helpers for `taskwire`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

/// Name of the gauge tracking active connections.
pub const CONNECTIONS_ACTIVE: &str = "taskwire_connections_active";
/// Name of the counter tracking processed logical messages.
pub const MESSAGES_PROCESSED: &str = "taskwire_messages_processed_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "taskwire_errors_total";

/// Direction of message processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Inbound messages received from the peer.
    Inbound,
    /// Outbound messages written to the peer.
    Outbound,
}

impl Direction {
    #[cfg(feature = "metrics")]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed message for the given direction.
pub fn inc_messages(direction: Direction) {
    #[cfg(feature = "metrics")]
    metrics::counter!(MESSAGES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record an error occurrence.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    metrics::counter!(ERRORS_TOTAL).increment(1);
}
