use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_stream::Stream;
use tracing::{debug, error, info, warn};

use crate::network::notify::Notifier;
use crate::network::{Connection, ConnectionRegistry};
use crate::{AppError, AppResult, ConnectionConfig, ServerConfig};

use super::{Shutdown, ShutdownTrigger};

/// Published once per accepted stream, or once per faulted accept.
#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    pub connection: Option<Connection>,
    pub fault: Option<Arc<AppError>>,
}

impl ConnectedEvent {
    fn connected(connection: Connection) -> Self {
        ConnectedEvent {
            connection: Some(connection),
            fault: None,
        }
    }

    fn faulted(fault: AppError) -> Self {
        ConnectedEvent {
            connection: None,
            fault: Some(Arc::new(fault)),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.fault.is_none()
    }
}

/// A stream handed out by a [`Listener`].
pub(crate) struct Accepted<S> {
    pub(crate) stream: S,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: SocketAddr,
}

/// Where the accept loop takes its streams from.
pub(crate) trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<Accepted<Self::Stream>>> + Send;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<Accepted<TcpStream>> {
        let (stream, peer_addr) = TcpListener::accept(self).await?;
        let local_addr = stream.local_addr().ok();
        Ok(Accepted {
            stream,
            local_addr,
            peer_addr,
        })
    }
}

enum ServerState {
    Created,
    Listening {
        local_addr: SocketAddr,
        acceptor: JoinHandle<()>,
    },
    Stopped,
}

/// A listening endpoint handing out server-owned [`Connection`]s.
///
/// Every accepted connection is registered until it is closed, either by its
/// owner or by [`Server::stop`]. Dropping the server stops accepting and
/// closes every registered connection without waiting for the accept loop.
pub struct Server {
    address: SocketAddr,
    config: ServerConfig,
    state: Mutex<ServerState>,
    registry: Arc<ConnectionRegistry>,
    connected: Arc<Notifier<ConnectedEvent>>,
    stop_trigger: ShutdownTrigger,
}

impl Server {
    /// Creates a server for `address` with default settings. Port 0 binds an
    /// ephemeral port, see [`Server::local_addr`].
    pub fn new(address: SocketAddr) -> Server {
        let config = ServerConfig {
            ip: address.ip().to_string(),
            port: address.port(),
            ..ServerConfig::default()
        };
        Self::build(address, config)
    }

    pub fn with_config(config: ServerConfig) -> AppResult<Server> {
        let address = config.socket_addr()?;
        Ok(Self::build(address, config))
    }

    fn build(address: SocketAddr, config: ServerConfig) -> Server {
        let connected = Arc::new(Notifier::retaining(config.event_capacity));
        Server {
            address,
            config,
            state: Mutex::new(ServerState::Created),
            registry: Arc::new(ConnectionRegistry::new()),
            connected,
            stop_trigger: ShutdownTrigger::new(),
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address.
    ///
    /// Fails if the server is already listening or was stopped; a server is
    /// started at most once.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        self.check_state("start")?;

        let listener = TcpListener::bind(self.address).await.map_err(|err| {
            error!(address = %self.address, %err, "failed to bind server");
            err
        })?;
        let local_addr = listener.local_addr()?;
        self.serve(listener, local_addr)?;
        info!("tcp server binding to {} for listening", local_addr);
        Ok(local_addr)
    }

    /// Spawns the accept loop over `listener`.
    fn serve<L: Listener>(&self, listener: L, local_addr: SocketAddr) -> AppResult<()> {
        let mut state = self.state.lock();
        // a concurrent start or stop won while we were binding
        if !matches!(*state, ServerState::Created) {
            return Err(AppError::IllegalStateError(format!(
                "server on {} was started or stopped concurrently",
                self.address
            )));
        }
        let acceptor = Acceptor {
            listener,
            local_addr,
            registry: self.registry.clone(),
            connected: self.connected.clone(),
            stop_trigger: self.stop_trigger.clone(),
            shutdown: self.stop_trigger.subscribe(),
            initial_backoff: Duration::from_millis(self.config.accept_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(self.config.max_accept_backoff_ms.max(1)),
            connection_config: self.config.connection.clone(),
        };
        *state = ServerState::Listening {
            local_addr,
            acceptor: tokio::spawn(acceptor.run()),
        };
        Ok(())
    }

    fn check_state(&self, action: &str) -> AppResult<()> {
        match &*self.state.lock() {
            ServerState::Created => Ok(()),
            ServerState::Listening { local_addr, .. } => Err(AppError::IllegalStateError(
                format!("cannot {} server already listening on {}", action, local_addr),
            )),
            ServerState::Stopped => Err(AppError::IllegalStateError(format!(
                "cannot {} a stopped server",
                action
            ))),
        }
    }

    /// Stops accepting, releases the listener, and closes every registered
    /// connection. Connected subscriptions end once their buffered events are
    /// read. Safe to call more than once.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ServerState::Stopped);
        self.stop_trigger.fire();

        if let ServerState::Listening {
            local_addr,
            acceptor,
        } = previous
        {
            if let Err(err) = acceptor.await {
                error!(%local_addr, %err, "accept loop ended abnormally");
            }
            info!(%local_addr, "tcp server stopped listening");
        }
        self.close_connections();
        self.connected.release_pending();
        self.connected.close();
    }

    fn close_connections(&self) {
        let connections = self.registry.snapshot();
        if !connections.is_empty() {
            debug!(count = connections.len(), "closing registered connections");
        }
        // each close removes itself from the registry while we iterate the copy
        for connection in connections {
            connection.close();
        }
        self.registry.clear();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            ServerState::Listening { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(*self.state.lock(), ServerState::Listening { .. })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Subscribes to accepted connections and accept faults. The first
    /// subscriber sees every event since the server was created.
    ///
    /// Registration of an accepted connection waits until every subscriber
    /// has room for its event, so no connection handle is ever lost to a slow
    /// subscriber.
    pub fn subscribe_connected(&self) -> async_channel::Receiver<ConnectedEvent> {
        self.connected.subscribe()
    }

    pub fn connected_stream(&self) -> impl Stream<Item = ConnectedEvent> + Unpin + Send + 'static {
        Box::pin(self.subscribe_connected())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            ServerState::Created => "created",
            ServerState::Listening { .. } => "listening",
            ServerState::Stopped => "stopped",
        };
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("state", &state)
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_trigger.fire();
        self.close_connections();
        self.connected.release_pending();
        self.connected.close();
        debug!("tcp server dropped");
    }
}

/// The accept loop of one listening server.
struct Acceptor<L> {
    listener: L,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    connected: Arc<Notifier<ConnectedEvent>>,
    stop_trigger: ShutdownTrigger,
    shutdown: Shutdown,
    initial_backoff: Duration,
    max_backoff: Duration,
    connection_config: ConnectionConfig,
}

impl<L: Listener> Acceptor<L> {
    async fn run(mut self) {
        let mut backoff = self.initial_backoff;
        loop {
            debug!("accept new connection");
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.recv() => break,
            };

            match accepted {
                Ok(accepted) => {
                    backoff = self.initial_backoff;
                    // registration runs on its own task so the next accept is
                    // issued right away
                    let registration = Registration {
                        registry: self.registry.clone(),
                        connected: self.connected.clone(),
                        stop_trigger: self.stop_trigger.clone(),
                        config: self.connection_config.clone(),
                    };
                    tokio::spawn(registration.register(accepted));
                }
                Err(err) => {
                    warn!(local_addr = %self.local_addr, %err, backoff_ms = backoff.as_millis() as u64, "failed to accept");
                    let fault = ConnectedEvent::faulted(AppError::Accept(err.to_string()));
                    tokio::select! {
                        _ = self.connected.publish(fault) => {}
                        _ = self.shutdown.recv() => break,
                    }
                    tokio::select! {
                        _ = time::sleep(backoff) => {}
                        _ = self.shutdown.recv() => break,
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
        debug!(local_addr = %self.local_addr, "accept loop exited");
    }
}

struct Registration {
    registry: Arc<ConnectionRegistry>,
    connected: Arc<Notifier<ConnectedEvent>>,
    stop_trigger: ShutdownTrigger,
    config: ConnectionConfig,
}

impl Registration {
    async fn register<S>(self, accepted: Accepted<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Accepted {
            stream,
            local_addr,
            peer_addr,
        } = accepted;
        let connection = Connection::accepted(
            stream,
            local_addr,
            Some(peer_addr),
            &self.registry,
            self.config,
        );

        let event = if !self.registry.add(connection.clone()) {
            error!(connection = %connection.id(), %peer_addr, "connection identity already registered");
            connection.close();
            ConnectedEvent::faulted(AppError::DuplicateConnection(connection.id()))
        } else if self.stop_trigger.is_fired() {
            // stop() may have taken its snapshot before this connection was added
            connection.close();
            ConnectedEvent::faulted(AppError::ServerStopped)
        } else {
            info!(connection = %connection.id(), %peer_addr, "accepted connection");
            ConnectedEvent::connected(connection)
        };
        self.connected.publish(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::Instant;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = Server::new(loopback());
        let local_addr = server.start().await.unwrap();
        assert_ne!(local_addr.port(), 0);
        assert_eq!(server.local_addr(), Some(local_addr));

        assert!(matches!(
            server.start().await,
            Err(AppError::IllegalStateError(_))
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let server = Server::new(loopback());
        server.start().await.unwrap();
        assert!(server.is_listening());

        server.stop().await;
        server.stop().await;
        assert!(!server.is_listening());
        assert_eq!(server.local_addr(), None);
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = Server::new(loopback());
        server.stop().await;
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_releases_listener() {
        let server = Server::new(loopback());
        let local_addr = server.start().await.unwrap();
        server.stop().await;

        // nothing listens on the port any more
        assert!(TcpStream::connect(local_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_with_config_rejects_bad_address() {
        let config = ServerConfig {
            ip: "localhost-ish".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::with_config(config),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_after_stop_is_refused() {
        let server = Server::new(loopback());
        server.start().await.unwrap();
        let connected = server.subscribe_connected();

        // a stream accepted just before stop() fired
        let (stream, _peer) = duplex(64);
        let registration = Registration {
            registry: server.registry().clone(),
            connected: server.connected.clone(),
            stop_trigger: server.stop_trigger.clone(),
            config: ConnectionConfig::default(),
        };
        server.stop_trigger.fire();
        registration
            .register(Accepted {
                stream,
                local_addr: None,
                peer_addr: loopback(),
            })
            .await;

        let event = connected.recv().await.unwrap();
        assert!(matches!(event.fault.as_deref(), Some(AppError::ServerStopped)));
        assert_eq!(server.connection_count(), 0);
        server.stop().await;
        assert!(connected.recv().await.is_err());
    }

    /// Replays scripted accept results, then never accepts again.
    struct ScriptedListener {
        script: VecDeque<io::Result<DuplexStream>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl Listener for ScriptedListener {
        type Stream = DuplexStream;

        fn accept(
            &mut self,
        ) -> impl Future<Output = io::Result<Accepted<DuplexStream>>> + Send {
            self.attempts.lock().push(Instant::now());
            let next = self.script.pop_front();
            async move {
                match next {
                    Some(result) => result.map(|stream| Accepted {
                        stream,
                        local_addr: None,
                        peer_addr: "127.0.0.1:4000".parse().unwrap(),
                    }),
                    None => std::future::pending().await,
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_faults_back_off_and_recover() {
        let server = Server::with_config(ServerConfig {
            accept_backoff_ms: 10,
            max_accept_backoff_ms: 40,
            ..ServerConfig::default()
        })
        .unwrap();
        let connected = server.subscribe_connected();

        let (stream, _peer) = duplex(64);
        let mut script: VecDeque<io::Result<DuplexStream>> = (0..5)
            .map(|_| Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .collect();
        script.push_back(Ok(stream));
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let listener = ScriptedListener {
            script,
            attempts: attempts.clone(),
        };
        server.serve(listener, loopback()).unwrap();

        for _ in 0..5 {
            let event = connected.recv().await.unwrap();
            assert!(event.connection.is_none());
            assert!(matches!(event.fault.as_deref(), Some(AppError::Accept(_))));
        }
        let event = connected.recv().await.unwrap();
        assert!(event.succeeded());
        let connection = event.connection.unwrap();
        assert!(connection.is_server_connection());
        assert!(server.registry().contains(connection.id()));

        // the loop kept accepting, doubling the pause up to the ceiling
        let attempts = attempts.lock().clone();
        assert!(attempts.len() >= 6);
        let pauses: Vec<u128> = attempts
            .windows(2)
            .take(5)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert_eq!(pauses, vec![10, 20, 40, 40, 40]);

        server.stop().await;
        assert!(connection.is_closed());
    }
}
