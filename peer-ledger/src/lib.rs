//! In-memory ledger shared by peers over plain TCP.
//!
//! Peers connect, announce an id on the first line, and then send
//! newline-delimited commands (`balance`, `Pay <peer_id> <amount>`). Balances
//! start at zero, live only in the server's memory, and may go negative.
//!
//! - [`cli`] parses the `server` and `client` subcommands.
//! - [`config`] turns server arguments into a [`config::ServerConfig`].
//! - [`server`] accepts connections and runs one task per peer.
//! - [`registry`] maps ids to connected peers behind a single lock.
//! - [`peer`] holds a peer's balance and its outbound line queue.
//! - [`command`] parses command lines and replies to the issuing peer.
//! - [`ledger`] settles transfers and notifies both sides.
//! - [`client`] is the terminal front-end relaying stdin to the server.

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod ledger;
pub mod peer;
pub mod registry;
pub mod server;
