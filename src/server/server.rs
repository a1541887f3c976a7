//! TCP server for the rate limit protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use super::auth::{AuthToken, KeyValueStore};
use super::service::CommandService;
use crate::config::ServerConfig;
use crate::error::{FloodgateError, Result};
use crate::protocol::{
    decode_client_frame, ClientFrame, FrameReader, FrameWriter, ServerFrame, PROTOCOL_VERSION,
};
use crate::ratelimit::{CounterStore, PolicyRegistry, Sweeper};

const EVENT_CAPACITY: usize = 16;
/// Pause after a failed accept so a full fd table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle events published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is bound and accepting
    Listening(SocketAddr),
    /// A server-level failure that did not stop the server
    Error(String),
}

/// The authoritative rate limit server.
///
/// Owns the policy registry and the counter store. Nothing is reachable
/// until [`Server::start`] has loaded or created the auth token.
pub struct Server {
    config: ServerConfig,
    registry: Arc<PolicyRegistry>,
    store: Arc<CounterStore>,
    key_store: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Create a server with an empty registry and store.
    pub fn new(config: ServerConfig, key_store: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry: Arc::new(PolicyRegistry::new()),
            store: Arc::new(CounterStore::new()),
            key_store,
            events,
        }
    }

    /// Replace the counter store, e.g. with one on a controlled clock.
    pub fn with_store(mut self, store: Arc<CounterStore>) -> Self {
        self.store = store;
        self
    }

    /// Registry for configuration-time policy registration.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Subscribe to lifecycle events, including the `Listening` event that
    /// [`Server::start`] publishes.
    pub fn subscribe(&self) -> BroadcastStream<ServerEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Load the auth token, bind, and start accepting connections.
    ///
    /// Fails with a configuration error before touching the key store or
    /// the network if the server settings are unusable.
    pub async fn start(self) -> Result<ServerHandle> {
        self.config.validate()?;
        let token = Arc::new(AuthToken::load_or_create(self.key_store.as_ref()).await?);

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %self.config.listen_addr, error = %e, "Failed to bind");
                let _ = self.events.send(ServerEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweep_task =
            Sweeper::new(self.store.clone(), self.config.sweep_interval()).start(shutdown_rx.clone());

        let acceptor = Acceptor {
            listener,
            token,
            service: CommandService::new(self.store.clone()),
            config: self.config.clone(),
            events: self.events.clone(),
            shutdown: shutdown_rx,
        };
        let accept_task = tokio::spawn(acceptor.run());

        info!(
            addr = %local_addr,
            policies = self.registry.len(),
            "Rate limit server listening"
        );
        let _ = self.events.send(ServerEvent::Listening(local_addr));

        Ok(ServerHandle {
            local_addr,
            registry: self.registry,
            store: self.store,
            events: self.events,
            shutdown,
            accept_task,
            sweep_task,
        })
    }
}

/// A running server.
///
/// Dropping the handle without calling [`ServerHandle::stop`] also shuts the
/// background tasks down, just without waiting for them.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<PolicyRegistry>,
    store: Arc<CounterStore>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// The store itself, as the limiter for callers inside this process.
    pub fn store(&self) -> Arc<CounterStore> {
        self.store.clone()
    }

    pub fn subscribe(&self) -> BroadcastStream<ServerEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Stop accepting, let in-flight commands finish, cancel the sweep and
    /// release the listening socket.
    pub async fn stop(self) {
        info!(addr = %self.local_addr, "Stopping rate limit server");
        let _ = self.shutdown.send(true);

        if let Err(e) = self.accept_task.await {
            error!(error = %e, "Accept loop ended abnormally");
        }
        if let Err(e) = self.sweep_task.await {
            error!(error = %e, "Eviction sweeper ended abnormally");
        }
        info!(addr = %self.local_addr, "Rate limit server stopped");
    }
}

/// Accept loop state.
struct Acceptor {
    listener: TcpListener,
    token: Arc<AuthToken>,
    service: CommandService,
    config: ServerConfig,
    events: broadcast::Sender<ServerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Acceptor {
    async fn run(self) {
        let Acceptor {
            listener,
            token,
            service,
            config,
            events,
            mut shutdown,
        } = self;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let connection = Connection {
                            peer,
                            token: token.clone(),
                            service: service.clone(),
                            handshake_timeout: config.handshake_timeout(),
                            max_frame_bytes: config.max_frame_bytes,
                            shutdown: shutdown.clone(),
                        };
                        connections.spawn(connection.run(stream));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        let _ = events.send(ServerEvent::Error(e.to_string()));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        debug!(open = connections.len(), "Listener closed, draining connections");
        while connections.join_next().await.is_some() {}
    }
}

/// One client connection.
struct Connection {
    peer: SocketAddr,
    token: Arc<AuthToken>,
    service: CommandService,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        let peer = self.peer;
        match self.serve(stream).await {
            Ok(()) => debug!(peer = %peer, "Connection closed"),
            Err(FloodgateError::Authentication(reason)) => {
                warn!(peer = %peer, reason = %reason, "Rejected connection")
            }
            Err(e) => debug!(peer = %peer, error = %e, "Connection closed with error"),
        }
    }

    async fn serve(self, stream: TcpStream) -> Result<()> {
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, self.max_frame_bytes);
        let mut writer = FrameWriter::new(write);

        if let Err(e) = self.authenticate(&mut reader).await {
            let _ = writer
                .send(&ServerFrame::Rejected {
                    reason: e.to_string(),
                })
                .await;
            let _ = writer.shutdown().await;
            return Err(e);
        }
        writer.send(&ServerFrame::Welcome).await?;
        debug!(peer = %self.peer, "Connection authenticated");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                frame = reader.next_frame() => {
                    let reply = match frame {
                        Ok(Some(line)) => self.handle_frame(&line).await,
                        Ok(None) => break,
                        Err(e @ FloodgateError::Protocol(_)) => {
                            warn!(peer = %self.peer, error = %e, "Rejecting unreadable frame");
                            ServerFrame::failure(None, &e)
                        }
                        Err(e) => return Err(e),
                    };
                    writer.send(&reply).await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(peer = %self.peer, "Closing connection for shutdown");
                        break;
                    }
                }
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }

    async fn authenticate<R>(&self, reader: &mut FrameReader<R>) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let first = tokio::time::timeout(self.handshake_timeout, reader.next_frame())
            .await
            .map_err(|_| FloodgateError::Authentication("handshake timed out".to_string()))??;
        let Some(first) = first else {
            return Err(FloodgateError::Authentication(
                "connection closed before handshake".to_string(),
            ));
        };

        match decode_client_frame(&first) {
            Ok(ClientFrame::Hello { version, .. }) if version != PROTOCOL_VERSION => {
                Err(FloodgateError::Authentication(format!(
                    "unsupported protocol version {} (expected {})",
                    version, PROTOCOL_VERSION
                )))
            }
            Ok(ClientFrame::Hello { key, .. }) if self.token.verify(&key) => Ok(()),
            Ok(ClientFrame::Hello { .. }) => {
                Err(FloodgateError::Authentication("invalid key".to_string()))
            }
            _ => Err(FloodgateError::Authentication(
                "expected hello frame".to_string(),
            )),
        }
    }

    async fn handle_frame(&self, line: &str) -> ServerFrame {
        match decode_client_frame(line) {
            Ok(ClientFrame::Request { id, command }) => match self.service.execute(command).await {
                Ok(reply) => ServerFrame::Response { id, reply },
                Err(e) => ServerFrame::failure(Some(id), &e),
            },
            Ok(ClientFrame::Ping { nonce }) => ServerFrame::Pong { nonce },
            Ok(ClientFrame::Hello { .. }) => ServerFrame::failure(
                None,
                &FloodgateError::Protocol("connection is already authenticated".to_string()),
            ),
            Err((id, e)) => {
                warn!(peer = %self.peer, error = %e, "Rejecting malformed frame");
                ServerFrame::failure(id, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_server_frame, Command, Reply};
    use crate::ratelimit::Policy;
    use crate::server::auth::{MemoryKeyStore, AUTH_TOKEN_RECORD};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            handshake_timeout_ms: 500,
            ..ServerConfig::default()
        }
    }

    async fn start() -> (ServerHandle, Arc<MemoryKeyStore>) {
        let keys = Arc::new(MemoryKeyStore::new());
        let server = Server::new(test_config(), keys.clone());
        (server.start().await.unwrap(), keys)
    }

    async fn token(keys: &MemoryKeyStore) -> String {
        keys.load(AUTH_TOKEN_RECORD).await.unwrap().unwrap()
    }

    async fn raw_connect(
        addr: SocketAddr,
        key: &str,
    ) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>, ServerFrame) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, 64 * 1024);
        let mut writer = FrameWriter::new(write);
        writer
            .send(&ClientFrame::Hello {
                key: key.to_string(),
                version: PROTOCOL_VERSION,
            })
            .await
            .unwrap();
        let line = reader.next_frame().await.unwrap().unwrap();
        (reader, writer, decode_server_frame(&line).unwrap())
    }

    async fn next(reader: &mut FrameReader<OwnedReadHalf>) -> ServerFrame {
        decode_server_frame(&reader.next_frame().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_start_publishes_listening() {
        let keys = Arc::new(MemoryKeyStore::new());
        let server = Server::new(test_config(), keys);
        let mut events = server.subscribe();

        let handle = server.start().await.unwrap();
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event, ServerEvent::Listening(handle.local_addr()));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_publishes_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            listen_addr: occupied.local_addr().unwrap(),
            ..test_config()
        };
        let server = Server::new(config, Arc::new(MemoryKeyStore::new()));
        let mut events = server.subscribe();

        assert!(matches!(server.start().await, Err(FloodgateError::Io(_))));
        assert!(matches!(
            events.next().await,
            Some(Ok(ServerEvent::Error(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let keys = Arc::new(MemoryKeyStore::new());
        let config = ServerConfig {
            sweep_interval_secs: 0,
            ..test_config()
        };

        let result = Server::new(config, keys.clone()).start().await;
        assert!(matches!(result, Err(FloodgateError::Configuration(_))));
        // Nothing was persisted for a server that never started.
        assert!(keys.load(AUTH_TOKEN_RECORD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_peer_rejected_after_handshake_timeout() {
        let (handle, _keys) = start().await;

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read, _write) = stream.into_split();
        let mut reader = FrameReader::new(read, 1024);

        let frame = tokio::time::timeout(Duration::from_secs(5), next(&mut reader))
            .await
            .expect("server never gave up on the handshake");
        match frame {
            ServerFrame::Rejected { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(reader.next_frame().await.unwrap().is_none());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let (handle, _keys) = start().await;

        let (mut reader, _writer, frame) = raw_connect(handle.local_addr(), "wrong").await;
        assert!(matches!(frame, ServerFrame::Rejected { .. }));
        assert!(reader.next_frame().await.unwrap().is_none());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_request_before_hello_rejected() {
        let (handle, _keys) = start().await;

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, 1024);
        let mut writer = FrameWriter::new(write);
        writer
            .send(&ClientFrame::Request {
                id: Uuid::new_v4(),
                command: Command::ResetAll,
            })
            .await
            .unwrap();

        assert!(matches!(next(&mut reader).await, ServerFrame::Rejected { .. }));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_limit_over_the_wire() {
        let (handle, keys) = start().await;
        let key = token(&keys).await;
        let (mut reader, mut writer, frame) = raw_connect(handle.local_addr(), &key).await;
        assert_eq!(frame, ServerFrame::Welcome);

        let groups = vec![Policy::new("login", 1, 60).unwrap()];
        for expect_allowed in [true, false] {
            let id = Uuid::new_v4();
            writer
                .send(&ClientFrame::Request {
                    id,
                    command: Command::Limit {
                        ip: "1.2.3.4".to_string(),
                        groups: groups.clone(),
                    },
                })
                .await
                .unwrap();

            match next(&mut reader).await {
                ServerFrame::Response {
                    id: got,
                    reply: Reply::Limit { response },
                } => {
                    assert_eq!(got, id);
                    assert_eq!(response.is_none(), expect_allowed);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_protocol_error_only_affects_sender() {
        let (handle, keys) = start().await;
        let key = token(&keys).await;
        let (mut bad_reader, mut bad_writer, _) = raw_connect(handle.local_addr(), &key).await;
        let (mut good_reader, mut good_writer, _) = raw_connect(handle.local_addr(), &key).await;

        let id = Uuid::new_v4();
        let line = serde_json::json!({"type": "request", "id": id, "command": {"name": "explode"}});
        bad_writer.send(&line).await.unwrap();
        match next(&mut bad_reader).await {
            ServerFrame::Failed { id: got, .. } => assert_eq!(got, Some(id)),
            other => panic!("unexpected frame {:?}", other),
        }

        // The offending connection stays usable, and so does the other one.
        bad_writer.send(&ClientFrame::Ping { nonce: 1 }).await.unwrap();
        assert_eq!(next(&mut bad_reader).await, ServerFrame::Pong { nonce: 1 });
        good_writer.send(&ClientFrame::Ping { nonce: 2 }).await.unwrap();
        assert_eq!(next(&mut good_reader).await, ServerFrame::Pong { nonce: 2 });

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_token_survives_restart() {
        let keys = Arc::new(MemoryKeyStore::new());
        let first = Server::new(test_config(), keys.clone()).start().await.unwrap();
        let key = token(&keys).await;
        first.stop().await;

        let second = Server::new(test_config(), keys.clone()).start().await.unwrap();
        let (_r, _w, frame) = raw_connect(second.local_addr(), &key).await;
        assert_eq!(frame, ServerFrame::Welcome);
        second.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_socket_and_closes_connections() {
        let (handle, keys) = start().await;
        let addr = handle.local_addr();
        let key = token(&keys).await;
        let (mut reader, _writer, _) = raw_connect(addr, &key).await;

        handle.stop().await;

        // Open connections see EOF and the port is free again.
        assert!(reader.next_frame().await.unwrap().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
