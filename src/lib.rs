//! webtransport-echo: an echo endpoint over a multiplexed transport.
//!
//! The endpoint is purely reactive. A transport session reports readiness
//! events; the runtime routes each one to the session visitor or to the
//! visitor bound to the stream it concerns:
//!
//! - Bidirectional streams echo data back on the same stream, fin included.
//! - Unidirectional streams are buffered in full and sent back on a new
//!   outgoing unidirectional stream, in completion order.
//! - Datagrams are answered with a fixed acknowledgment.
//!
//! `transport::memory` provides a deterministic in-process transport used
//! by the tests and by the loopback run of the binary.

pub mod config;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod visitor;
