use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    command::process_command,
    config::ServerConfig,
    peer::{Inbox, Peer, drain_outbox},
    registry::Registry,
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest line accepted from a peer, terminator excluded. Anything longer
/// ends the connection.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds the listening socket described by `config`.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle on the peer registry, mainly for inspection in tests.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    let peers = state.registry.len().await;
                    info!(peers, "server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
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

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &Arc<ServerState>) {
    match result {
        Ok((stream, addr)) => spawn_connection_handler(stream, addr, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, addr: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, addr, state).await {
            warn!(%addr, error = ?err, "peer connection closed with error");
        }
    });
}

struct ServerState {
    registry: Arc<Registry>,
    config: ServerConfig,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        let registry = match config.max_peers {
            Some(limit) => Registry::with_capacity_limit(limit),
            None => Registry::new(),
        };
        Self {
            registry: Arc::new(registry),
            config,
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    serve_connection(BufReader::new(reader), writer, &state, Some(addr)).await
}

/// Drives one connection from handshake to disconnect.
///
/// The write half is handed to the peer's outbox writer task; from then on
/// this function only reads.
async fn serve_connection<R, W>(
    mut reader: R,
    writer: W,
    state: &ServerState,
    addr: Option<SocketAddr>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let idle_timeout = state.config.idle_timeout;
    let Some(raw_id) = read_line(&mut reader, idle_timeout).await? else {
        debug!(?addr, "connection closed before handshake");
        return Ok(());
    };

    let (peer, inbox) = Peer::channel(raw_id.trim());
    let peer = Arc::new(peer);
    spawn_outbox_writer(inbox, writer, peer.id().to_string());

    if let Err(err) = state
        .registry
        .admit(Arc::clone(&peer), state.config.duplicate_policy)
        .await
    {
        info!(?addr, peer = %peer.id(), reason = %err, "peer refused");
        peer.send_line(err.to_string()).await;
        return Ok(());
    }

    println!("Peer connected: {}", peer.id());
    info!(?addr, peer = %peer.id(), "peer connected");

    let session = run_peer_session(state, &mut reader, &peer, idle_timeout).await;
    cleanup_peer_disconnect(state, &peer, addr).await;

    session
}

fn spawn_outbox_writer<W>(inbox: Inbox, writer: W, id: String)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = drain_outbox(inbox, writer).await {
            debug!(peer = %id, ?err, "failed to deliver output to peer");
        }
    });
}

async fn run_peer_session<R>(
    state: &ServerState,
    reader: &mut R,
    peer: &Peer,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = read_line(reader, idle_timeout).await? {
        process_command(&state.registry, peer, &line).await;
    }
    Ok(())
}

async fn cleanup_peer_disconnect(state: &ServerState, peer: &Arc<Peer>, addr: Option<SocketAddr>) {
    if !state.registry.unregister_peer(peer).await {
        debug!(peer = %peer.id(), "peer entry already replaced");
    }
    println!("Peer disconnected: {}", peer.id());
    info!(?addr, peer = %peer.id(), "peer disconnected");
}

/// Reads one line without its terminator. `Ok(None)` means the peer closed
/// the connection; a line over [`MAX_LINE_BYTES`] is an `InvalidData` error.
async fn read_line<R>(reader: &mut R, idle_timeout: Option<Duration>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    // Slack for a "\r\n" terminator after a maximal line.
    let mut limited = (&mut *reader).take(MAX_LINE_BYTES as u64 + 2);
    let bytes = match idle_timeout {
        Some(limit) => match timeout(limit, limited.read_line(&mut line)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "peer idle timeout"));
            }
        },
        None => limited.read_line(&mut line).await?,
    };

    if bytes == 0 {
        return Ok(None);
    }
    let content = line.trim_end_matches(LINE_ENDINGS);
    if content.len() > MAX_LINE_BYTES || (bytes > MAX_LINE_BYTES && !line.ends_with('\n')) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_BYTES} bytes"),
        ));
    }
    Ok(Some(content.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct TestConnection {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        input: WriteHalf<DuplexStream>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl TestConnection {
        async fn send(&mut self, line: &str) {
            self.input
                .write_all(format!("{line}\n").as_bytes())
                .await
                .expect("write line");
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(Duration::from_secs(1), self.lines.next_line())
                .await
                .expect("timed out waiting for line")
                .expect("read line")
        }
    }

    fn connect(state: &Arc<ServerState>) -> TestConnection {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let state = Arc::clone(state);
        let task = tokio::spawn(async move {
            serve_connection(BufReader::new(server_read), server_write, &state, None).await
        });

        TestConnection {
            lines: BufReader::new(client_read).lines(),
            input: client_write,
            task,
        }
    }

    async fn wait_for_peer(state: &ServerState, id: &str) -> Arc<Peer> {
        for _ in 0..100 {
            if let Some(peer) = state.registry.lookup(id).await {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer {id} never registered");
    }

    #[tokio::test]
    async fn handshake_trims_identity_and_registers() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let mut conn = connect(&state);

        conn.send("  alice \r").await;
        let peer = wait_for_peer(&state, "alice").await;
        assert_eq!(peer.balance(), 0);

        conn.send("balance").await;
        assert_eq!(conn.recv().await.as_deref(), Some("Balance: 0"));
    }

    #[tokio::test]
    async fn disconnect_before_handshake_registers_nothing() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let mut conn = connect(&state);
        conn.input.shutdown().await.expect("shutdown");

        conn.task.await.expect("handler task").expect("clean close");
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn disconnect_unregisters_peer() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let mut conn = connect(&state);
        conn.send("alice").await;
        wait_for_peer(&state, "alice").await;

        conn.input.shutdown().await.expect("shutdown");
        conn.task.await.expect("handler task").expect("clean close");
        assert!(state.registry.lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn pay_notifies_target_connection() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let mut alice = connect(&state);
        let mut bob = connect(&state);
        alice.send("alice").await;
        bob.send("bob").await;
        wait_for_peer(&state, "alice").await;
        wait_for_peer(&state, "bob").await;

        alice.send("Pay bob 30").await;
        assert_eq!(alice.recv().await.as_deref(), Some("Sent 30 to bob"));
        assert_eq!(bob.recv().await.as_deref(), Some("Received 30 from alice"));

        bob.send("balance").await;
        assert_eq!(bob.recv().await.as_deref(), Some("Balance: 30"));
        alice.send("balance").await;
        assert_eq!(alice.recv().await.as_deref(), Some("Balance: -30"));
    }

    #[tokio::test]
    async fn stale_duplicate_does_not_evict_replacement() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let mut first = connect(&state);
        first.send("alice").await;
        let original = wait_for_peer(&state, "alice").await;

        let mut second = connect(&state);
        second.send("alice").await;
        for _ in 0..100 {
            let current = state.registry.lookup("alice").await.expect("alice");
            if !Arc::ptr_eq(&current, &original) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(original);

        first.input.shutdown().await.expect("shutdown");
        first.task.await.expect("handler task").expect("clean close");
        assert!(state.registry.lookup("alice").await.is_some());

        second.send("balance").await;
        assert_eq!(second.recv().await.as_deref(), Some("Balance: 0"));
    }

    #[tokio::test]
    async fn reject_policy_refuses_duplicate_id() {
        let config = ServerConfig {
            duplicate_policy: DuplicatePolicy::Reject,
            ..ServerConfig::default()
        };
        let state = Arc::new(ServerState::new(config));
        let mut first = connect(&state);
        first.send("alice").await;
        wait_for_peer(&state, "alice").await;

        let mut second = connect(&state);
        second.send("alice").await;
        assert_eq!(second.recv().await.as_deref(), Some("Peer id already connected"));
        assert_eq!(second.recv().await, None);
        second.task.await.expect("handler task").expect("clean close");
    }

    #[tokio::test]
    async fn peer_limit_refuses_newcomers() {
        let config = ServerConfig {
            max_peers: Some(1),
            ..ServerConfig::default()
        };
        let state = Arc::new(ServerState::new(config));
        let mut first = connect(&state);
        first.send("alice").await;
        wait_for_peer(&state, "alice").await;

        let mut second = connect(&state);
        second.send("bob").await;
        assert_eq!(second.recv().await.as_deref(), Some("Server is full"));
        assert!(state.registry.lookup("bob").await.is_none());
    }

    type ClientLines = tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>;

    /// Streams a line longer than [`MAX_LINE_BYTES`] from a background task.
    /// The client halves are returned so the connection stays open meanwhile.
    fn send_oversized_line(
        conn: TestConnection,
    ) -> (
        tokio::task::JoinHandle<Result<()>>,
        ClientLines,
        tokio::task::JoinHandle<()>,
    ) {
        let TestConnection {
            lines,
            mut input,
            task,
        } = conn;
        let writer = tokio::spawn(async move {
            // The server hangs up part-way through, so the write may fail.
            let _ = input.write_all(&vec![b'a'; MAX_LINE_BYTES + 1024]).await;
        });
        (task, lines, writer)
    }

    #[tokio::test]
    async fn oversized_identity_is_refused() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let conn = connect(&state);
        let (task, _lines, _writer) = send_oversized_line(conn);

        let result = timeout(Duration::from_secs(5), task)
            .await
            .expect("handler finished")
            .expect("handler task");
        let err = result.expect_err("over-long identity is a read failure");
        let io_err = err.downcast_ref::<io::Error>().expect("io error");
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn oversized_command_disconnects_peer() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let mut conn = connect(&state);
        conn.send("alice").await;
        wait_for_peer(&state, "alice").await;

        let (task, _lines, _writer) = send_oversized_line(conn);
        let result = timeout(Duration::from_secs(5), task)
            .await
            .expect("handler finished")
            .expect("handler task");
        assert!(result.is_err());
        assert!(state.registry.lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let input = format!("{}\nbalance\n", "b".repeat(MAX_LINE_BYTES));
        let mut reader = BufReader::new(input.as_bytes());
        let line = read_line(&mut reader, None)
            .await
            .expect("read")
            .expect("line");
        assert_eq!(line.len(), MAX_LINE_BYTES);
        assert_eq!(
            read_line(&mut reader, None).await.expect("read").as_deref(),
            Some("balance")
        );
    }

    #[tokio::test]
    async fn line_limit_excludes_terminator() {
        let input = format!(
            "{}\r\n{}\n",
            "b".repeat(MAX_LINE_BYTES),
            "c".repeat(MAX_LINE_BYTES + 1)
        );
        let mut reader = BufReader::new(input.as_bytes());
        let line = read_line(&mut reader, None)
            .await
            .expect("read")
            .expect("line");
        assert_eq!(line.len(), MAX_LINE_BYTES);

        let err = read_line(&mut reader, None)
            .await
            .expect_err("one byte over the limit");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn idle_peer_is_disconnected() {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_millis(200)),
            ..ServerConfig::default()
        };
        let state = Arc::new(ServerState::new(config));
        let mut conn = connect(&state);
        conn.send("alice").await;
        wait_for_peer(&state, "alice").await;

        let result = conn.task.await.expect("handler task");
        assert!(result.is_err());
        assert!(state.registry.lookup("alice").await.is_none());
    }
}
