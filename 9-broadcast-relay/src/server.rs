use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    handler::ConnectionHandler,
    registry::{ClientRegistry, ConnectionId},
};

/// What happens to connected clients once the server stops accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ShutdownPolicy {
    /// Close every client transport and wait for their teardown.
    Close,
    /// Leave clients connected until they disconnect on their own.
    Drain,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Lines buffered per client before it counts as unreachable.
    pub outbound_capacity: usize,
    pub shutdown: ShutdownPolicy,
    /// Consecutive unrecognised accept failures tolerated before giving up.
    /// Resource exhaustion never counts toward this.
    pub max_accept_failures: u32,
    /// Pause after an accept failure that is not about a single connection.
    pub accept_backoff: Duration,
    /// Upper bound on waiting for clients to tear down under [`ShutdownPolicy::Close`].
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 1024,
            shutdown: ShutdownPolicy::Close,
            max_accept_failures: 64,
            accept_backoff: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Source of client transports for [`BroadcastServer`].
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%peer, ?error, "failed to set TCP_NODELAY");
        }
        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

pub struct BroadcastServer<L = TcpListener> {
    listener: L,
    registry: Arc<ClientRegistry>,
    config: ServerConfig,
}

impl<L: Listener> BroadcastServer<L> {
    pub fn new(listener: L) -> Self {
        Self::with_config(listener, ServerConfig::default())
    }

    pub fn with_config(listener: L, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(ClientRegistry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts clients until `shutdown` resolves or the listener becomes unusable.
    ///
    /// Only [`RelayError::ListenerFatal`] is returned; per-connection failures
    /// and resource exhaustion are logged and retried.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let BroadcastServer {
            mut listener,
            registry,
            config,
        } = self;
        let connections = CancellationToken::new();
        let mut next_id: ConnectionId = 1;
        let mut consecutive_failures = 0u32;
        let mut exhausted_streak = 0u32;
        tokio::pin!(shutdown);

        loop {
            let accepted = select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            let err = match accepted {
                Ok((stream, peer)) => {
                    consecutive_failures = 0;
                    exhausted_streak = 0;
                    spawn_connection_handler(
                        stream,
                        peer,
                        next_id,
                        &registry,
                        &connections,
                        &config,
                    );
                    next_id += 1;
                    continue;
                }
                Err(err) => err,
            };

            match classify_accept_error(&err) {
                AcceptFailure::Connection => {
                    debug!(error = ?err, "transient accept failure");
                    continue;
                }
                AcceptFailure::Exhausted => {
                    exhausted_streak += 1;
                    if exhausted_streak == 1 {
                        warn!(error = %err, "out of resources accepting connections; backing off");
                    } else {
                        debug!(error = %err, exhausted_streak, "still out of resources");
                    }
                }
                AcceptFailure::Listener => {
                    connections.cancel();
                    return Err(RelayError::ListenerFatal(err));
                }
                AcceptFailure::Unrecognised => {
                    consecutive_failures += 1;
                    warn!(error = ?err, consecutive_failures, "failed to accept connection");
                    if consecutive_failures >= config.max_accept_failures {
                        connections.cancel();
                        return Err(RelayError::ListenerFatal(err));
                    }
                }
            }

            select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(config.accept_backoff) => {}
            }
        }

        drop(listener);
        shut_down_clients(&registry, &connections, &config).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection_handler<S>(
    stream: S,
    peer: SocketAddr,
    id: ConnectionId,
    registry: &Arc<ClientRegistry>,
    connections: &CancellationToken,
    config: &ServerConfig,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let handler = ConnectionHandler::new(
        id,
        Some(peer),
        stream,
        Arc::clone(registry),
        connections.child_token(),
        config.outbound_capacity,
    );
    tokio::spawn(async move {
        if let Err(err) = handler.run().await {
            warn!(%peer, connection_id = id, error = %err, "connection dropped before joining");
        }
    });
}

async fn shut_down_clients(
    registry: &ClientRegistry,
    connections: &CancellationToken,
    config: &ServerConfig,
) {
    match config.shutdown {
        ShutdownPolicy::Drain => {
            let clients = registry.snapshot_size().await;
            info!(clients, "relay stopped accepting; clients drain on their own");
        }
        ShutdownPolicy::Close => {
            info!("relay shutting down; closing clients");
            connections.cancel();
            registry.close_all().await;
            if tokio::time::timeout(config.shutdown_grace, registry.wait_until_empty())
                .await
                .is_err()
            {
                let remaining = registry.snapshot_size().await;
                warn!(remaining, "clients still registered after shutdown grace period");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Concerns one pending connection; accept again at once.
    Connection,
    /// Out of descriptors or memory; the listening socket is still fine.
    Exhausted,
    /// The listening socket itself is unusable.
    Listener,
    Unrecognised,
}

fn classify_accept_error(err: &io::Error) -> AcceptFailure {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => return AcceptFailure::Connection,
        io::ErrorKind::OutOfMemory => return AcceptFailure::Exhausted,
        _ => {}
    }

    if let Some(failure) = err.raw_os_error().and_then(classify_os_error) {
        return failure;
    }

    match err.kind() {
        io::ErrorKind::InvalidInput => AcceptFailure::Listener,
        _ => AcceptFailure::Unrecognised,
    }
}

#[cfg(unix)]
fn classify_os_error(code: i32) -> Option<AcceptFailure> {
    match code {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
            Some(AcceptFailure::Exhausted)
        }
        libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EFAULT => {
            Some(AcceptFailure::Listener)
        }
        // accept(2) passes these through from the pending connection.
        libc::EPROTO
        | libc::ENOPROTOOPT
        | libc::ENETDOWN
        | libc::ENETUNREACH
        | libc::EHOSTDOWN
        | libc::EHOSTUNREACH
        | libc::EPERM => Some(AcceptFailure::Connection),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os_error(_code: i32) -> Option<AcceptFailure> {
    None
}
