//! Client handle for a remote rate limit server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::backoff::Backoff;
use super::supervisor::{Outbound, Session, Shared, Supervisor};
use crate::config::ClientConfig;
use crate::error::{FloodgateError, Result};
use crate::protocol::{Command, Reply};
use crate::ratelimit::{Decision, Limiter, Policy};
use crate::server::{AuthToken, KeyValueStore};

const EVENT_CAPACITY: usize = 16;
const OUTBOUND_CAPACITY: usize = 256;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; every call fails with a connection error
    Closed,
}

/// Lifecycle events published by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A lost connection was re-established
    Reconnect,
    /// The client gave up or was closed
    Close,
}

/// A connection to the authoritative server.
///
/// Calls may be issued concurrently from any number of tasks; responses are
/// matched back by request id. A background supervisor owns the socket and
/// reconnects with backoff when it drops.
pub struct Client {
    config: ClientConfig,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect using the token persisted in `key_store`.
    pub async fn connect(config: ClientConfig, key_store: &dyn KeyValueStore) -> Result<Self> {
        config.validate()?;
        let token = AuthToken::load(key_store).await?;
        Self::connect_with_token(config, token).await
    }

    /// Connect with a token obtained out of band.
    pub async fn connect_with_token(config: ClientConfig, token: AuthToken) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared::new(events));

        shared.set_state(ConnectionState::Connecting);
        let session = match Session::open(&config, &token).await {
            Ok(session) => session,
            Err(e) => {
                shared.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };
        shared.set_state(ConnectionState::Connected);
        info!(server = %config.server_addr, "Connected to rate limit server");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            backoff: Backoff::from_config(&config),
            config: config.clone(),
            token,
            shared: shared.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(supervisor.run(session));

        Ok(Self {
            config,
            shared,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.watch_state()
    }

    /// Subscribe to `reconnect` and `close` events.
    pub fn subscribe(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.shared.subscribe())
    }

    /// Count a call by `identity` against `policies` on the server.
    #[instrument(skip(self, policies), fields(groups = policies.len()))]
    pub async fn limit(&self, identity: &str, policies: &[Policy]) -> Result<Decision> {
        let reply = self
            .call(Command::Limit {
                ip: identity.to_string(),
                groups: policies.to_vec(),
            })
            .await?;

        match reply {
            Reply::Limit { response: None } => Ok(Decision::Allow),
            Reply::Limit {
                response: Some(millis),
            } => {
                let reset_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                    FloodgateError::Protocol(format!("reset instant {} out of range", millis))
                })?;
                Ok(Decision::Deny { reset_at })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Zero the counts of one group on the server.
    pub async fn reset(&self, group: &str) -> Result<()> {
        match self
            .call(Command::Reset {
                group: group.to_string(),
            })
            .await?
        {
            Reply::Reset { error: None } => Ok(()),
            Reply::Reset { error: Some(e) } => Err(FloodgateError::Protocol(e)),
            other => Err(unexpected(&other)),
        }
    }

    /// Zero every count on the server.
    pub async fn reset_all(&self) -> Result<()> {
        match self.call(Command::ResetAll).await? {
            Reply::ResetAll { error: None } => Ok(()),
            Reply::ResetAll { error: Some(e) } => Err(FloodgateError::Protocol(e)),
            other => Err(unexpected(&other)),
        }
    }

    /// Stop the supervisor and fail anything still pending. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn call(&self, command: Command) -> Result<Reply> {
        if self.shared.state() == ConnectionState::Closed {
            return Err(closed());
        }

        let id = Uuid::new_v4();
        let deadline = self.config.request_timeout();
        let rx = self.shared.register(id);
        debug!(id = %id, command = command.name(), "Sending request");

        let outcome = timeout(deadline, async {
            self.outbound
                .send(Outbound { id, command })
                .await
                .map_err(|_| closed())?;
            rx.await.map_err(|_| closed())?
        })
        .await;
        self.shared.abandon(&id);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!(id = %id, "Request timed out");
                Err(FloodgateError::Timeout(deadline))
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.config.server_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Limiter for Client {
    async fn limit(&self, identity: &str, policies: &[Policy]) -> Result<Decision> {
        Client::limit(self, identity, policies).await
    }

    async fn reset(&self, group: &str) -> Result<()> {
        Client::reset(self, group).await
    }

    async fn reset_all(&self) -> Result<()> {
        Client::reset_all(self).await
    }
}

fn closed() -> FloodgateError {
    FloodgateError::Connection("client is closed".to_string())
}

fn unexpected(reply: &Reply) -> FloodgateError {
    FloodgateError::Protocol(format!("unexpected reply {:?}", reply))
}
