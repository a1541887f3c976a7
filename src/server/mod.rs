//! The authoritative rate limit server.

mod auth;
#[allow(clippy::module_inception)]
mod server;
mod service;

pub use auth::{AuthToken, FileKeyStore, KeyValueStore, MemoryKeyStore, AUTH_TOKEN_RECORD};
pub use server::{Server, ServerEvent, ServerHandle};
pub use service::CommandService;
