use std::{
    io,
    sync::atomic::{AtomicI64, Ordering},
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::debug;

/// Lines that may wait for a connection's writer before senders block.
pub const OUTBOX_CAPACITY: usize = 64;

/// Sending side of a peer's outbound line queue.
pub type Outbox = mpsc::Sender<String>;
/// Receiving side, owned by the connection's single writer task.
pub type Inbox = mpsc::Receiver<String>;

/// One connected participant.
///
/// A peer never touches its socket directly. Everything addressed to it, be it
/// a command response or a transfer notification raised by another
/// connection, is queued on its [`Outbox`] and written by one task, so lines
/// from different connections cannot interleave on the wire.
///
/// The outbox is bounded. When a peer stops reading its socket, whoever is
/// sending to it waits for room, so a slow reader throttles its senders
/// instead of growing the queue.
#[derive(Debug)]
pub struct Peer {
    id: String,
    balance: AtomicI64,
    outbox: Outbox,
}

impl Peer {
    pub fn new(id: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            id: id.into(),
            balance: AtomicI64::new(0),
            outbox,
        }
    }

    /// Creates a peer together with the receiving end of its outbox.
    pub fn channel(id: impl Into<String>) -> (Self, Inbox) {
        let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
        (Self::new(id, outbox), inbox)
    }

    #[cfg(test)]
    pub(crate) fn with_balance(id: impl Into<String>, balance: i64) -> (Self, Inbox) {
        let (peer, inbox) = Self::channel(id);
        peer.balance.store(balance, Ordering::SeqCst);
        (peer, inbox)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balance(&self) -> i64 {
        self.balance.load(Ordering::SeqCst)
    }

    /// Subtracts `amount` and returns the new balance. Going negative is allowed.
    pub(crate) fn debit(&self, amount: i64) -> i64 {
        self.balance
            .fetch_sub(amount, Ordering::SeqCst)
            .wrapping_sub(amount)
    }

    pub(crate) fn credit(&self, amount: i64) -> i64 {
        self.balance
            .fetch_add(amount, Ordering::SeqCst)
            .wrapping_add(amount)
    }

    /// Queues one line (without its trailing newline) for delivery, waiting
    /// while the outbox is full.
    ///
    /// Returns `false` when the connection's writer has already gone away.
    pub async fn send_line(&self, line: impl Into<String>) -> bool {
        if self.outbox.send(line.into()).await.is_err() {
            debug!(peer = %self.id, "dropping line for closed connection");
            return false;
        }
        true
    }
}

/// Writes every queued line to `writer` until all outbox senders are dropped,
/// then shuts the writer down.
pub async fn drain_outbox<W>(mut inbox: Inbox, mut writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = inbox.recv().await {
        let mut encoded = line.into_bytes();
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
