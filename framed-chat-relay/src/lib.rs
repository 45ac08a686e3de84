//! Multi-client chat relay over a fixed-width length-prefixed TCP protocol.
//!
//! Clients announce a username with their first frame and then send message
//! frames; the relay forwards each message, prefixed with the sender's
//! username frame, to every other connected client.
//!
//! - [`frame`] encodes and decodes the 10-byte decimal header framing.
//! - [`registry`] tracks accepted connections and their captured identities.
//! - [`relay`] runs the single-task event loop: accept, identify, fan out,
//!   tear down.
//! - [`session`] is the client library: connect, send, and a background
//!   listener that reports `(username, message)` pairs through callbacks.
//! - [`cli`] and [`client`] provide the command-line front end.

pub mod cli;
pub mod client;
pub mod frame;
pub mod registry;
pub mod relay;
pub mod session;
