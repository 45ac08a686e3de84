use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{frame::DEFAULT_MAX_PAYLOAD_LEN, relay::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, forwarding every message to all other clients.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub listen: SocketAddr,

    /// Largest payload a client may declare before it is disconnected.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_LEN)]
    pub max_payload_len: usize,
}

impl From<&RelayArgs> for RelayConfig {
    fn from(args: &RelayArgs) -> Self {
        Self {
            listen: args.listen,
            max_payload_len: args.max_payload_len,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username announced to the relay and shown to other participants.
    #[arg(long)]
    pub username: String,

    /// Relay host name or IP address.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Relay port.
    #[arg(long, default_value_t = 1234)]
    pub port: u16,

    /// Largest message this client sends or accepts.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_LEN)]
    pub max_payload_len: usize,
}
