use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
};

use anyhow::Result;
use futures::{
    future::{AbortHandle, Abortable},
    stream::{self, BoxStream, SelectAll, StreamExt},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::broadcast,
};
use tracing::{debug, info, warn};

use crate::{
    frame::{DEFAULT_MAX_PAYLOAD_LEN, Frame, FrameError, read_frame},
    registry::{ConnectionId, ConnectionState, Registry},
};

pub const DEFAULT_PORT: u16 = 1234;

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Frames declaring a longer payload drop the sending connection.
    pub max_payload_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// Lifecycle notifications published by a running relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Joined {
        id: ConnectionId,
        peer: SocketAddr,
        username: String,
    },
    /// The connection went away before sending its identity frame.
    Abandoned { id: ConnectionId, peer: SocketAddr },
    Relayed {
        from: ConnectionId,
        username: String,
        recipients: usize,
    },
    Left {
        id: ConnectionId,
        username: String,
        reason: LeaveReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveReason {
    Closed,
    ReadFailed(String),
    WriteFailed(String),
    Shutdown,
}

pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    events: broadcast::Sender<RelayEvent>,
}

impl Relay {
    /// Binds the configured address with `SO_REUSEADDR` so a restarted relay
    /// can take its port back immediately.
    pub fn bind(config: RelayConfig) -> io::Result<Self> {
        let socket = match config.listen {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.listen)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            listener,
            config,
            events,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Runs the event loop until `shutdown` resolves. Every registry change
    /// and every relay write happens on this one task.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            config,
            events,
        } = self;
        let mut state: RelayState<OwnedWriteHalf> = RelayState::new(config.max_payload_len, events);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    state.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    state.handle_accept(accept_result);
                }
                Some((id, inbound)) = state.inbound.next() => {
                    state.handle_inbound(id, inbound).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// What a connection's read side produced.
#[derive(Debug)]
enum Inbound {
    Frame(Frame),
    Closed,
    Failed(FrameError),
}

type InboundStream = Abortable<BoxStream<'static, (ConnectionId, Inbound)>>;

struct RelayState<W> {
    registry: Registry<W>,
    inbound: SelectAll<InboundStream>,
    max_payload_len: usize,
    events: broadcast::Sender<RelayEvent>,
}

impl RelayState<OwnedWriteHalf> {
    fn handle_accept(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match result {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = ?err, "failed to accept connection");
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let (abort, registration) = AbortHandle::new_pair();
        let id = self.registry.admit(peer, writer, abort);
        let frames = frame_stream(id, reader, self.max_payload_len);
        self.inbound.push(Abortable::new(frames, registration));

        debug!(%id, %peer, "accepted connection, awaiting identity");
    }
}

impl<W> RelayState<W>
where
    W: AsyncWrite + Unpin,
{
    fn new(max_payload_len: usize, events: broadcast::Sender<RelayEvent>) -> Self {
        Self {
            registry: Registry::new(),
            inbound: SelectAll::new(),
            max_payload_len,
            events,
        }
    }

    fn publish(&self, event: RelayEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Usernames and messages must be UTF-8; anything else is the sender's
    /// protocol error and never reaches other clients.
    async fn handle_inbound(&mut self, id: ConnectionId, inbound: Inbound) {
        match inbound {
            Inbound::Frame(frame) => match frame.text().map(|_| ()) {
                Err(err) => self.drop_sender(id, err.into()).await,
                Ok(()) if self.registry.is_awaiting(id) => self.handle_identity(id, frame),
                Ok(()) => self.relay(id, frame).await,
            },
            Inbound::Closed => self.disconnect(id, LeaveReason::Closed).await,
            Inbound::Failed(err) => self.drop_sender(id, err).await,
        }
    }

    async fn drop_sender(&mut self, id: ConnectionId, err: FrameError) {
        debug!(%id, error = ?err, "read failed");
        self.disconnect(id, LeaveReason::ReadFailed(err.to_string()))
            .await;
    }

    fn handle_identity(&mut self, id: ConnectionId, identity: Frame) {
        let Some(connection) = self.registry.join(id, identity) else {
            return;
        };
        let peer = connection.peer;
        let username = connection.username().unwrap_or_default();

        info!(%peer, %id, username, "client joined");
        self.publish(RelayEvent::Joined { id, peer, username });
    }

    async fn relay(&mut self, sender: ConnectionId, message: Frame) {
        let Some(identity) = self.registry.identity(sender) else {
            debug!(%sender, "frame from unknown connection dropped");
            return;
        };
        let username = identity.text_lossy().into_owned();
        let mut item = identity.to_bytes();
        message.extend_into(&mut item);

        info!(%sender, username, text = %message.text_lossy(), "relaying message");

        let mut delivered = 0;
        let mut broken = Vec::new();
        for (recipient, connection) in self.registry.recipients_mut(sender) {
            match write_item(&mut connection.writer, &item).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(%recipient, error = ?err, "failed to deliver message");
                    broken.push((recipient, err.to_string()));
                }
            }
        }

        for (recipient, reason) in broken {
            self.disconnect(recipient, LeaveReason::WriteFailed(reason))
                .await;
        }

        self.publish(RelayEvent::Relayed {
            from: sender,
            username,
            recipients: delivered,
        });
    }

    /// Unregisters first, then closes the transport.
    async fn disconnect(&mut self, id: ConnectionId, reason: LeaveReason) {
        let Some(mut connection) = self.registry.remove(id) else {
            return;
        };
        connection.cancel_reader();
        if let Err(err) = connection.writer.shutdown().await {
            debug!(%id, error = ?err, "shutdown after disconnect failed");
        }

        match connection.state {
            ConnectionState::AwaitingIdentity => {
                debug!(peer = %connection.peer, %id, "connection closed before identifying");
                self.publish(RelayEvent::Abandoned {
                    id,
                    peer: connection.peer,
                });
            }
            ConnectionState::Joined { identity } => {
                let username = identity.text_lossy().into_owned();
                match &reason {
                    LeaveReason::Closed => {
                        info!(peer = %connection.peer, %id, username, "client disconnected")
                    }
                    other => {
                        info!(peer = %connection.peer, %id, username, reason = ?other, "client dropped")
                    }
                }
                self.publish(RelayEvent::Left {
                    id,
                    username,
                    reason,
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(
            joined = self.registry.joined_len(),
            awaiting = self.registry.awaiting_len(),
            usernames = ?self.registry.usernames(),
            "relay shutting down"
        );
        for (id, mut connection) in self.registry.drain() {
            connection.cancel_reader();
            let _ = connection.writer.shutdown().await;
            if let ConnectionState::Joined { identity } = connection.state {
                self.publish(RelayEvent::Left {
                    id,
                    username: identity.text_lossy().into_owned(),
                    reason: LeaveReason::Shutdown,
                });
            }
        }
    }
}

async fn write_item<W>(writer: &mut W, item: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(item).await?;
    writer.flush().await
}

/// Turns a read half into a stream of frames that ends after the first
/// close or failure.
fn frame_stream(
    id: ConnectionId,
    reader: OwnedReadHalf,
    max_payload_len: usize,
) -> BoxStream<'static, (ConnectionId, Inbound)> {
    stream::unfold(Some(BufReader::new(reader)), move |reader| async move {
        let Some(mut reader) = reader else {
            return None;
        };
        let inbound = match read_frame(&mut reader, max_payload_len).await {
            Ok(Some(frame)) => return Some(((id, Inbound::Frame(frame)), Some(reader))),
            Ok(None) => Inbound::Closed,
            Err(err) => Inbound::Failed(err),
        };
        Some(((id, inbound), None))
    })
    .boxed()
}
