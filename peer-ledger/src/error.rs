use thiserror::Error;

/// Protocol-level failures reported back to the peer that caused them.
///
/// The `Display` text of each variant is the exact line written to the
/// connection (without the trailing newline), so callers can reply with
/// `err.to_string()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Usage: Pay <peer_id> <amount>")]
    PayUsage,

    #[error("Invalid amount")]
    InvalidAmount,

    #[error("Target peer not found")]
    TargetNotFound,

    #[error("Unknown command")]
    UnknownCommand,

    #[error("Peer id already connected")]
    DuplicatePeer(String),

    #[error("Server is full")]
    RegistryFull,
}
