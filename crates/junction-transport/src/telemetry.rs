//! Message counters shared by every transport.
//!
//! Recorded through the `metrics` facade, so they cost nothing until the
//! binary installs a recorder.

use metrics::counter;

/// Counter of messages moved through transports, labelled by
/// `transport` and `direction`.
pub const MESSAGES_TOTAL: &str = "junction_messages_total";

/// Counter of frames dropped because they could not be decoded.
pub const DECODE_ERRORS_TOTAL: &str = "junction_decode_errors_total";

/// Record a message received from a client.
pub fn record_inbound(transport: &'static str) {
    counter!(MESSAGES_TOTAL, "transport" => transport, "direction" => "inbound").increment(1);
}

/// Record a message written to a client.
pub fn record_outbound(transport: &'static str) {
    counter!(MESSAGES_TOTAL, "transport" => transport, "direction" => "outbound").increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_error(transport: &'static str) {
    counter!(DECODE_ERRORS_TOTAL, "transport" => transport).increment(1);
}
