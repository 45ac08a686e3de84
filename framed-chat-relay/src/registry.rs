//! Server-side table of live connections.
//!
//! Connections are keyed by a [`ConnectionId`] handed out on accept rather
//! than by socket handle. A freshly accepted connection waits in the
//! awaiting set until its identity frame arrives; only then does it move to
//! the joined set and become a relay recipient.

use std::{collections::HashMap, fmt, net::SocketAddr};

use futures::future::AbortHandle;

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingIdentity,
    Joined { identity: Frame },
}

/// One accepted transport. `W` is the write half; the read half lives in the
/// relay's multiplexed read set and is cancelled through `reader`.
#[derive(Debug)]
pub struct Connection<W> {
    pub peer: SocketAddr,
    pub writer: W,
    pub state: ConnectionState,
    reader: AbortHandle,
}

impl<W> Connection<W> {
    pub fn identity(&self) -> Option<&Frame> {
        match &self.state {
            ConnectionState::AwaitingIdentity => None,
            ConnectionState::Joined { identity } => Some(identity),
        }
    }

    pub fn username(&self) -> Option<String> {
        self.identity().map(|frame| frame.text_lossy().into_owned())
    }

    /// Stops the read side. The caller drops or shuts down `writer`.
    pub fn cancel_reader(&self) {
        self.reader.abort();
    }
}

pub struct Registry<W> {
    awaiting: HashMap<ConnectionId, Connection<W>>,
    joined: HashMap<ConnectionId, Connection<W>>,
    next_id: u64,
}

impl<W> Default for Registry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Registry<W> {
    pub fn new() -> Self {
        Self {
            awaiting: HashMap::new(),
            joined: HashMap::new(),
            next_id: 1,
        }
    }

    /// Records an accepted connection that has not yet identified itself.
    pub fn admit(&mut self, peer: SocketAddr, writer: W, reader: AbortHandle) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.awaiting.insert(
            id,
            Connection {
                peer,
                writer,
                state: ConnectionState::AwaitingIdentity,
                reader,
            },
        );
        id
    }

    /// Promotes an awaiting connection using its first frame as identity.
    /// Returns `None` if `id` was not awaiting.
    pub fn join(&mut self, id: ConnectionId, identity: Frame) -> Option<&Connection<W>> {
        let mut connection = self.awaiting.remove(&id)?;
        connection.state = ConnectionState::Joined { identity };
        self.joined.insert(id, connection);
        self.joined.get(&id)
    }

    /// Removes the connection from whichever set holds it. The transport is
    /// still open in the returned value; closing it is the caller's job.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<W>> {
        self.joined
            .remove(&id)
            .or_else(|| self.awaiting.remove(&id))
    }

    pub fn identity(&self, id: ConnectionId) -> Option<&Frame> {
        self.joined.get(&id).and_then(Connection::identity)
    }

    pub fn is_awaiting(&self, id: ConnectionId) -> bool {
        self.awaiting.contains_key(&id)
    }

    #[cfg(test)]
    pub fn is_joined(&self, id: ConnectionId) -> bool {
        self.joined.contains_key(&id)
    }

    /// Every joined connection except `sender`.
    pub fn recipients_mut(
        &mut self,
        sender: ConnectionId,
    ) -> impl Iterator<Item = (ConnectionId, &mut Connection<W>)> + '_ {
        self.joined
            .iter_mut()
            .filter(move |(id, _)| **id != sender)
            .map(|(id, connection)| (*id, connection))
    }

    pub fn joined_len(&self) -> usize {
        self.joined.len()
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.joined.values().filter_map(Connection::username).collect();
        names.sort();
        names
    }

    /// Empties both sets, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<(ConnectionId, Connection<W>)> {
        self.joined
            .drain()
            .chain(self.awaiting.drain())
            .collect()
    }
}
