//! Server configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::ValueEnum;

use crate::cli::ServerArgs;

/// What to do when a peer connects with an id that is already registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DuplicatePolicy {
    /// Replace the registered peer; the older connection stays open but can
    /// no longer receive transfers.
    #[default]
    Overwrite,
    /// Refuse the newcomer and close its connection.
    Reject,
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub bind: IpAddr,

    /// TCP port; 0 picks an ephemeral port.
    pub port: u16,

    /// Upper bound on registered peers, unlimited when `None`.
    pub max_peers: Option<usize>,

    /// Disconnect peers that send nothing for this long.
    pub idle_timeout: Option<Duration>,

    pub duplicate_policy: DuplicatePolicy,
}

impl ServerConfig {
    /// Create a server configuration from CLI arguments.
    pub fn from_args(args: &ServerArgs) -> Self {
        Self {
            bind: args.bind,
            port: args.port,
            max_peers: args.max_peers,
            idle_timeout: args.idle_timeout.map(Duration::from_secs),
            duplicate_policy: args.on_duplicate,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_peers: None,
            idle_timeout: None,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}
