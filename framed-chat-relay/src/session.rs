//! Client side of the relay protocol.
//!
//! A [`Session`] owns one TCP connection. [`Session::connect`] sends the
//! identity frame before returning, [`Session::send`] writes message frames,
//! and [`Session::start_listening`] moves the read half into a background
//! task that decodes relayed `(username, message)` pairs and hands them to a
//! callback. Callbacks run on that task; callers that need a particular
//! thread must re-dispatch themselves.
//!
//! The session state is shared with the listening task, so a relay that
//! goes away moves the session to [`SessionState::Closed`] without any call
//! from the owner.

use std::{fmt, io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::frame::{DEFAULT_MAX_PAYLOAD_LEN, FrameError, read_frame, write_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send username: {0}")]
    Handshake(#[source] FrameError),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session is closed")]
    Closed,

    #[error("message of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Write(#[from] FrameError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ListenError {
    #[error("session is already listening")]
    AlreadyListening,
}

pub struct Session {
    username: String,
    peer: SocketAddr,
    state: watch::Sender<SessionState>,
    max_payload_len: usize,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    write_shut: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("listening", &self.reader.is_none())
            .finish()
    }
}

impl Session {
    /// Opens a connection and announces `username`. Failures are returned
    /// as-is; there is no retry.
    pub async fn connect(host: &str, port: u16, username: &str) -> Result<Self, ConnectError> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        transition(&state, SessionState::Connecting);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ConnectError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;
        let peer = stream.peer_addr().map_err(|source| ConnectError::Connect {
            addr: format!("{host}:{port}"),
            source,
        })?;
        let (reader, mut writer) = stream.into_split();

        transition(&state, SessionState::Handshaking);
        write_frame(&mut writer, username.as_bytes())
            .await
            .map_err(ConnectError::Handshake)?;

        transition(&state, SessionState::Active);
        info!(%peer, username, "connected to relay");

        Ok(Self {
            username: username.to_string(),
            peer,
            state,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            reader: Some(BufReader::new(reader)),
            writer,
            write_shut: false,
        })
    }

    /// Like [`Session::connect`], but reports failure through `on_error`
    /// with a human-readable reason instead of returning it.
    pub async fn connect_reporting<E>(
        host: &str,
        port: u16,
        username: &str,
        on_error: E,
    ) -> Option<Self>
    where
        E: FnOnce(String),
    {
        match Self::connect(host, port, username).await {
            Ok(session) => Some(session),
            Err(err) => {
                on_error(format!("Connection error: {err}"));
                None
            }
        }
    }

    /// Caps outgoing messages. Incoming frames are capped too, but only by
    /// a listener started after this call; a running listener keeps the
    /// limit it was spawned with.
    pub fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follows state changes, including the move to `Closed` made by the
    /// listening task.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Writes one message frame. A failed write is reported but does not
    /// close the session; the listening task notices a dead connection on
    /// its own.
    pub async fn send(&mut self, message: &str) -> Result<(), SendError> {
        if self.state() == SessionState::Closed {
            return Err(SendError::Closed);
        }
        if message.len() > self.max_payload_len {
            return Err(SendError::PayloadTooLarge {
                len: message.len(),
                max: self.max_payload_len,
            });
        }

        write_frame(&mut self.writer, message.as_bytes()).await?;
        Ok(())
    }

    /// Spawns the receive loop. `on_message` fires once per relayed pair in
    /// arrival order; `on_error` fires exactly once when the loop stops,
    /// after the session has moved to `Closed`.
    pub fn start_listening<M, E>(
        &mut self,
        on_message: M,
        on_error: E,
    ) -> Result<JoinHandle<()>, ListenError>
    where
        M: FnMut(String, String) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        let reader = self.reader.take().ok_or(ListenError::AlreadyListening)?;
        let max_payload_len = self.max_payload_len;
        let state = self.state.clone();
        Ok(tokio::spawn(async move {
            let reason = listen(reader, max_payload_len, on_message).await;
            debug!(reason, "listening stopped");
            transition(&state, SessionState::Closed);
            on_error(reason);
        }))
    }

    /// Shuts down the write direction. Any running listener sees the relay
    /// drop the connection and reports it through `on_error`. Also releases
    /// the socket of a session the relay already closed.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.write_shut {
            return Ok(());
        }
        self.write_shut = true;
        transition(&self.state, SessionState::Closed);
        self.writer.shutdown().await
    }
}

fn transition(state: &watch::Sender<SessionState>, next: SessionState) {
    let from = state.send_replace(next);
    if from != next {
        debug!(?from, to = ?next, "session state change");
    }
}

/// Reads relayed pairs until the stream ends and returns why it ended.
async fn listen<R, M>(mut reader: R, max_payload_len: usize, mut on_message: M) -> String
where
    R: AsyncRead + Unpin,
    M: FnMut(String, String),
{
    loop {
        match read_relayed(&mut reader, max_payload_len).await {
            Ok(Some((username, message))) => on_message(username, message),
            Ok(None) => return "Connection closed by the server".to_string(),
            Err(err) => return format!("Reading error: {err}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RelayedError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection closed between username and message")]
    Truncated,
}

async fn read_relayed<R>(
    reader: &mut R,
    max_payload_len: usize,
) -> Result<Option<(String, String)>, RelayedError>
where
    R: AsyncRead + Unpin,
{
    let Some(username) = read_frame(reader, max_payload_len).await? else {
        return Ok(None);
    };
    let message = read_frame(reader, max_payload_len)
        .await?
        .ok_or(RelayedError::Truncated)?;

    let username = username.into_text().map_err(FrameError::from)?;
    let message = message.into_text().map_err(FrameError::from)?;
    Ok(Some((username, message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    fn relayed(username: &str, message: &str) -> Vec<u8> {
        let mut bytes = encode_frame(username.as_bytes()).unwrap();
        bytes.extend(encode_frame(message.as_bytes()).unwrap());
        bytes
    }

    #[tokio::test]
    async fn listen_delivers_pairs_in_arrival_order() {
        let (mut relay, client) = tokio::io::duplex(1024);
        relay.write_all(&relayed("alice", "hi")).await.unwrap();
        relay.write_all(&relayed("bob", "hey alice")).await.unwrap();
        drop(relay);

        let mut received = Vec::new();
        let reason = listen(client, DEFAULT_MAX_PAYLOAD_LEN, |username, message| {
            received.push((username, message));
        })
        .await;

        assert_eq!(
            received,
            vec![
                ("alice".to_string(), "hi".to_string()),
                ("bob".to_string(), "hey alice".to_string()),
            ]
        );
        assert_eq!(reason, "Connection closed by the server");
    }

    #[tokio::test]
    async fn listen_uses_the_username_carried_by_each_item() {
        let (mut relay, client) = tokio::io::duplex(1024);
        relay.write_all(&relayed("carol", "one")).await.unwrap();
        relay.write_all(&relayed("caroline", "two")).await.unwrap();
        drop(relay);

        let mut senders = Vec::new();
        listen(client, DEFAULT_MAX_PAYLOAD_LEN, |username, _| senders.push(username)).await;

        assert_eq!(senders, vec!["carol", "caroline"]);
    }

    #[tokio::test]
    async fn listen_reports_malformed_header_as_reading_error() {
        let (mut relay, client) = tokio::io::duplex(1024);
        relay.write_all(b"garbage!!!").await.unwrap();

        let mut calls = 0;
        let reason = listen(client, DEFAULT_MAX_PAYLOAD_LEN, |_, _| calls += 1).await;

        assert_eq!(calls, 0);
        assert!(reason.starts_with("Reading error:"), "{reason}");
    }

    #[tokio::test]
    async fn listen_reports_item_cut_after_username() {
        let (mut relay, client) = tokio::io::duplex(1024);
        relay
            .write_all(&encode_frame(b"alice").unwrap())
            .await
            .unwrap();
        drop(relay);

        let reason = listen(client, DEFAULT_MAX_PAYLOAD_LEN, |_, _| {}).await;

        assert_eq!(
            reason,
            "Reading error: connection closed between username and message"
        );
    }

    #[tokio::test]
    async fn listen_rejects_invalid_utf8_payloads() {
        let (mut relay, client) = tokio::io::duplex(1024);
        let mut bytes = encode_frame(b"alice").unwrap();
        bytes.extend(encode_frame(&[0xc3, 0x28]).unwrap());
        relay.write_all(&bytes).await.unwrap();

        let reason = listen(client, DEFAULT_MAX_PAYLOAD_LEN, |_, _| {}).await;

        assert!(reason.contains("UTF-8"), "{reason}");
    }
}
