//! Transport-facing abstractions: inbound envelopes, outbound messages, and
//! the port the signal-cli adapter implements.

pub mod port;
pub mod retry;
pub mod types;
