//! Balance transfers between registered peers.

use tracing::debug;

use crate::{error::LedgerError, peer::Peer, registry::Registry};

/// Moves `amount` from `sender` to the registered peer `target_id` and
/// notifies both sides.
///
/// `amount` must already be validated as strictly positive. The registry lock
/// is released before any balance changes. Each side is updated atomically,
/// but the pair is not: a concurrent `balance` on the target may run between
/// the debit and the credit.
pub async fn transfer(
    registry: &Registry,
    sender: &Peer,
    target_id: &str,
    amount: i64,
) -> Result<(), LedgerError> {
    let Some(target) = registry.lookup(target_id).await else {
        return Err(LedgerError::TargetNotFound);
    };

    let sender_balance = sender.debit(amount);
    let target_balance = target.credit(amount);
    debug!(
        from = %sender.id(),
        to = %target_id,
        amount,
        sender_balance,
        target_balance,
        "transfer settled"
    );

    sender.send_line(format!("Sent {amount} to {target_id}")).await;
    target
        .send_line(format!("Received {amount} from {}", sender.id()))
        .await;
    Ok(())
}
