//! Connection supervisor: one background task per client that owns the
//! socket, answers keepalives and reconnects.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::{ClientEvent, ConnectionState};
use crate::config::ClientConfig;
use crate::error::{FloodgateError, Result};
use crate::protocol::{
    decode_server_frame, ClientFrame, Command, FrameReader, FrameWriter, Reply, ServerFrame,
    PROTOCOL_VERSION,
};
use crate::server::AuthToken;

/// A request waiting for the supervisor to write it.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub id: Uuid,
    pub command: Command,
}

/// State shared between the client handle and its supervisor.
pub(crate) struct Shared {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<Reply>>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            pending: Mutex::new(HashMap::new()),
            state,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Client state changed");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn register(&self, id: Uuid) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    /// Forget a request whose caller stopped waiting.
    pub fn abandon(&self, id: &Uuid) {
        self.pending.lock().remove(id);
    }

    fn is_pending(&self, id: &Uuid) -> bool {
        self.pending.lock().contains_key(id)
    }

    fn complete(&self, id: Uuid, result: Result<Reply>) {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id = %id, "Dropping response for abandoned request"),
        }
    }

    fn fail_all(&self, reason: &str) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(FloodgateError::Connection(reason.to_string())));
        }
    }
}

/// An authenticated connection.
pub(crate) struct Session {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Session {
    /// Connect and authenticate, bounded by the request timeout.
    pub async fn open(config: &ClientConfig, token: &AuthToken) -> Result<Self> {
        timeout(config.request_timeout(), Self::handshake(config, token))
            .await
            .map_err(|_| {
                FloodgateError::Connection(format!(
                    "handshake with {} timed out",
                    config.server_addr
                ))
            })?
    }

    async fn handshake(config: &ClientConfig, token: &AuthToken) -> Result<Self> {
        let stream = TcpStream::connect(&config.server_addr).await.map_err(|e| {
            FloodgateError::Connection(format!(
                "failed to connect to {}: {}",
                config.server_addr, e
            ))
        })?;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, config.max_frame_bytes);
        let mut writer = FrameWriter::new(write);
        writer
            .send(&ClientFrame::Hello {
                key: token.expose().to_string(),
                version: PROTOCOL_VERSION,
            })
            .await?;

        let Some(line) = reader.next_frame().await? else {
            return Err(FloodgateError::Connection(
                "server closed the connection during handshake".to_string(),
            ));
        };
        match decode_server_frame(&line)? {
            ServerFrame::Welcome => Ok(Self { reader, writer }),
            ServerFrame::Rejected { reason } => Err(FloodgateError::Authentication(reason)),
            other => Err(FloodgateError::Protocol(format!(
                "expected welcome, got {:?}",
                other
            ))),
        }
    }
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub(crate) struct Supervisor {
    pub config: ClientConfig,
    pub token: AuthToken,
    pub shared: Arc<Shared>,
    pub outbound: mpsc::Receiver<Outbound>,
    pub shutdown: watch::Receiver<bool>,
    pub backoff: Backoff,
}

impl Supervisor {
    /// Drive sessions until shutdown or until reconnecting gives up.
    pub async fn run(mut self, first: Session) {
        let mut session = first;
        loop {
            match self.drive(session).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    warn!(server = %self.config.server_addr, reason = %reason, "Connection lost");
                    self.shared.set_state(ConnectionState::Reconnecting);
                    match self.reconnect().await {
                        Some(next) => {
                            session = next;
                            self.shared.set_state(ConnectionState::Connected);
                            self.shared.emit(ClientEvent::Reconnect);
                        }
                        None => break,
                    }
                }
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        self.shared.fail_all("client is closed");
        self.shared.emit(ClientEvent::Close);
        info!(server = %self.config.server_addr, "Client closed");
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn reconnect(&mut self) -> Option<Session> {
        self.backoff.reset();
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                error!(
                    server = %self.config.server_addr,
                    attempts = self.backoff.attempt(),
                    "Reconnect attempts exhausted"
                );
                return None;
            };
            debug!(attempt = self.backoff.attempt(), delay = ?delay, "Waiting to reconnect");

            tokio::select! {
                _ = sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.shutdown_requested() {
                        return None;
                    }
                }
            }

            match Session::open(&self.config, &self.token).await {
                Ok(session) => {
                    info!(
                        server = %self.config.server_addr,
                        attempt = self.backoff.attempt(),
                        "Reconnected"
                    );
                    return Some(session);
                }
                Err(FloodgateError::Authentication(reason)) => {
                    error!(reason = %reason, "Server rejected credentials on reconnect");
                    return None;
                }
                Err(e) => debug!(error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn drive(&mut self, session: Session) -> SessionEnd {
        let Session {
            mut reader,
            mut writer,
        } = session;
        let keepalive = self.config.keepalive_interval();
        let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();
        let mut nonce = 0u64;
        let mut in_flight: HashSet<Uuid> = HashSet::new();

        let end = loop {
            tokio::select! {
                outbound = self.outbound.recv() => {
                    let Some(Outbound { id, command }) = outbound else {
                        break SessionEnd::Shutdown;
                    };
                    if !self.shared.is_pending(&id) {
                        trace!(id = %id, "Skipping request abandoned before send");
                        continue;
                    }
                    let frame = ClientFrame::Request { id, command };
                    if let Err(e) = writer.send(&frame).await {
                        self.shared.complete(id, Err(FloodgateError::Connection(e.to_string())));
                        break SessionEnd::Lost(e.to_string());
                    }
                    in_flight.insert(id);
                }
                frame = reader.next_frame() => match frame {
                    Ok(Some(line)) => {
                        last_seen = Instant::now();
                        match decode_server_frame(&line) {
                            Ok(frame) => self.dispatch(frame, &mut in_flight),
                            Err(e) => warn!(error = %e, "Ignoring undecodable server frame"),
                        }
                    }
                    Ok(None) => break SessionEnd::Lost("server closed the connection".to_string()),
                    Err(e) => break SessionEnd::Lost(e.to_string()),
                },
                _ = ticker.tick() => {
                    in_flight.retain(|id| self.shared.is_pending(id));
                    if last_seen.elapsed() > keepalive * 2 {
                        break SessionEnd::Lost("keepalive timed out".to_string());
                    }
                    nonce = nonce.wrapping_add(1);
                    if let Err(e) = writer.send(&ClientFrame::Ping { nonce }).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.shutdown_requested() {
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        // Requests written to this connection will never be answered.
        for id in in_flight {
            self.shared.complete(
                id,
                Err(FloodgateError::Connection(
                    "connection lost before a response arrived".to_string(),
                )),
            );
        }
        if matches!(end, SessionEnd::Shutdown) {
            let _ = writer.shutdown().await;
        }
        end
    }

    fn dispatch(&self, frame: ServerFrame, in_flight: &mut HashSet<Uuid>) {
        match frame {
            ServerFrame::Response { id, reply } => {
                in_flight.remove(&id);
                self.shared.complete(id, Ok(reply));
            }
            ServerFrame::Failed {
                id: Some(id),
                kind,
                message,
            } => {
                in_flight.remove(&id);
                self.shared
                    .complete(id, Err(ServerFrame::failure_error(kind, message)));
            }
            ServerFrame::Failed { id: None, message, .. } => {
                warn!(message = %message, "Server reported an uncorrelated failure")
            }
            ServerFrame::Pong { nonce } => trace!(nonce, "Keepalive answered"),
            ServerFrame::Welcome | ServerFrame::Rejected { .. } => {
                warn!("Unexpected handshake frame on an open connection")
            }
        }
    }
}
