//! Floodgate - Authoritative Rate Limiting Service
//!
//! A single server owns fixed-window counters for named policy groups and
//! answers `limit`, `reset` and `reset_all` commands over an authenticated
//! TCP connection. Clients keep one reconnecting connection to it, and the
//! admission layer turns their answers into admit / throttle decisions with
//! an explicit fail-open or fail-closed policy.

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ratelimit;
pub mod server;

pub use admission::{Admission, FailureMode, Verdict};
pub use client::{Client, ClientEvent, ConnectionState};
pub use error::{FloodgateError, Result};
pub use ratelimit::{CounterStore, Decision, Limiter, Policy, PolicyRegistry, PolicySpec};
pub use server::{Server, ServerEvent, ServerHandle};
