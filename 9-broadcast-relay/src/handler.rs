use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    message::{read_message, write_message, Announcement, Message},
    registry::{ClientHandle, ClientRegistry, ConnectionId, HandlerState},
};

/// How long a departing client's writer may spend flushing lines queued for it.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Drives one client from handshake to teardown.
pub struct ConnectionHandler<S> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    stream: S,
    registry: Arc<ClientRegistry>,
    closer: CancellationToken,
    outbound_capacity: usize,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        stream: S,
        registry: Arc<ClientRegistry>,
        closer: CancellationToken,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            registry,
            closer,
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Runs the connection to completion.
    ///
    /// Only a failed handshake is reported as an error; every way a
    /// registered session can end is normal teardown.
    pub async fn run(self) -> Result<(), RelayError> {
        let ConnectionHandler {
            id,
            peer,
            stream,
            registry,
            closer,
            outbound_capacity,
        } = self;

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        let name = match perform_handshake(&mut reader, &closer).await {
            Ok(name) => name,
            Err(err) => {
                closer.cancel();
                return Err(err);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        let handle = Arc::new(ClientHandle::new(
            id,
            name.clone(),
            outbound_tx,
            closer.clone(),
        ));
        let writer_task = tokio::spawn(run_writer(writer, outbound_rx, closer.clone(), id));

        let index = registry.register(&handle).await;
        info!(?peer, connection_id = id, index, %name, "client joined");
        registry
            .publish(&Announcement::Joined { name: name.clone() }, &[])
            .await;

        match run_session(&registry, &mut reader, &closer, &name).await {
            Ok(()) => debug!(connection_id = id, "session closed by relay"),
            Err(RelayError::Io(error)) => {
                debug!(connection_id = id, %error, "treating unreadable input as disconnect")
            }
            Err(reason) => debug!(connection_id = id, %reason, "session ended"),
        }

        teardown(&registry, handle, &closer, writer_task, peer).await;
        Ok(())
    }
}

async fn perform_handshake<R>(
    reader: &mut R,
    closer: &CancellationToken,
) -> Result<String, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let hello = select! {
        _ = closer.cancelled() => {
            return Err(RelayError::HandshakeFailed("server closed the connection".into()));
        }
        hello = read_message::<_, String>(reader) => hello,
    };

    match hello {
        Ok(Some(name)) => Ok(name),
        Ok(None) => Err(RelayError::HandshakeFailed(
            "connection closed before handshake".into(),
        )),
        Err(err) => Err(RelayError::HandshakeFailed(format!(
            "unreadable display name: {err}"
        ))),
    }
}

/// Relays the client's messages until it leaves.
///
/// `Ok` means the relay closed the session; errors describe how the peer went away.
async fn run_session<R>(
    registry: &ClientRegistry,
    reader: &mut R,
    closer: &CancellationToken,
    name: &str,
) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = select! {
            _ = closer.cancelled() => return Ok(()),
            message = read_message::<_, Message>(reader) => message?,
        };

        match message {
            Some(Message::Text { text }) => {
                let chat = Announcement::Chat {
                    name: name.to_string(),
                    text,
                };
                registry.publish(&chat, &[]).await;
            }
            Some(Message::Disconnect) | None => return Err(RelayError::PeerDisconnected),
        }
    }
}

/// Writes queued lines to the client.
///
/// Stops at once when `closer` fires; otherwise runs until every sender is
/// gone and the queue has been flushed.
async fn run_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    closer: CancellationToken,
    id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            biased;
            _ = closer.cancelled() => break,
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let written = select! {
            biased;
            _ = closer.cancelled() => break,
            written = write_message(&mut writer, &line) => written,
        };
        if let Err(err) = written {
            let error = RelayError::TransportWriteFailed(err);
            debug!(connection_id = id, %error, "closing client after failed write");
            closer.cancel();
            break;
        }
    }

    outbound.close();
    if let Err(error) = writer.shutdown().await {
        debug!(connection_id = id, ?error, "client writer did not shut down cleanly");
    }
}

/// Removes the client and stops its writer.
///
/// A client that left on its own still receives what was queued before it
/// was deregistered, its own last echo included. A client closed by the
/// relay is cut off immediately.
async fn teardown(
    registry: &ClientRegistry,
    handle: Arc<ClientHandle>,
    closer: &CancellationToken,
    mut writer_task: JoinHandle<()>,
    peer: Option<SocketAddr>,
) {
    let id = handle.id();
    let name = handle.name().to_string();

    handle.set_state(HandlerState::Disconnecting);
    let removed = registry.deregister(id).await;
    handle.set_state(HandlerState::Gone);

    // The registry only holds weak references, so this drops the last sender
    // and the writer exits once the queue is empty.
    drop(handle);
    let flushed = if closer.is_cancelled() {
        None
    } else {
        timeout(FLUSH_GRACE, &mut writer_task).await.ok()
    };
    closer.cancel();
    let joined = match flushed {
        Some(joined) => joined,
        None => writer_task.await,
    };
    if let Err(error) = joined {
        warn!(connection_id = id, ?error, "client writer task failed");
    }

    if removed {
        info!(?peer, connection_id = id, %name, "client disconnected");
        registry.publish(&Announcement::Left { name }, &[]).await;
    }
}
