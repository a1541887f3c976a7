//! Client for a remote rate limit server.

mod backoff;
#[allow(clippy::module_inception)]
mod client;
mod supervisor;

pub use backoff::Backoff;
pub use client::{Client, ClientEvent, ConnectionState};
