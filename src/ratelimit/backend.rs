//! Limiter trait for abstracting the in-process store and the remote client.

use async_trait::async_trait;
use std::sync::Arc;

use super::counter::Decision;
use super::policy::Policy;
use crate::error::Result;

/// Operations every limiter exposes.
///
/// Implemented by [`CounterStore`](super::CounterStore) for callers living in
/// the server's process and by [`Client`](crate::client::Client) for everyone
/// else, so the admission layer can work with either.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Count a call by `identity` against `policies` and decide it.
    async fn limit(&self, identity: &str, policies: &[Policy]) -> Result<Decision>;

    /// Zero the counts of one group.
    async fn reset(&self, group: &str) -> Result<()>;

    /// Zero the counts of every group.
    async fn reset_all(&self) -> Result<()>;
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    async fn limit(&self, identity: &str, policies: &[Policy]) -> Result<Decision> {
        (**self).limit(identity, policies).await
    }

    async fn reset(&self, group: &str) -> Result<()> {
        (**self).reset(group).await
    }

    async fn reset_all(&self) -> Result<()> {
        (**self).reset_all().await
    }
}
