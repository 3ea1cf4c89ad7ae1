use std::net::{IpAddr, Ipv4Addr};

use clap::{Args, Parser, Subcommand};

use crate::config::DuplicatePolicy;

/// Printed when the arguments do not form a valid invocation.
pub const USAGE: &str = "\
Usage:
  Server: peer_ledger server <port>
  Client: peer_ledger client <address> <peer_id>";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept peer connections and settle transfers between them.
    Server(ServerArgs),
    /// Connect to a server as a peer and relay commands from stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// TCP port to listen on. Use 0 for an ephemeral port.
    pub port: u16,

    /// Interface to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Refuse new peers once this many are connected.
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// Disconnect peers idle for this many seconds.
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// How to treat a peer id that is already connected.
    #[arg(long, value_enum, default_value_t = DuplicatePolicy::Overwrite)]
    pub on_duplicate: DuplicatePolicy,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server address, e.g. 127.0.0.1:8080.
    pub address: String,

    /// Identity announced to the server.
    pub peer_id: String,
}
