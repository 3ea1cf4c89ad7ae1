//! Line-oriented command parsing and dispatch.
//!
//! Each line a peer sends after its handshake is split on whitespace and
//! matched case-sensitively against the known commands:
//!
//! - `balance` replies with `Balance: <n>`
//! - `Pay <peer_id> <amount>` runs a [`transfer`]
//!
//! Anything else is answered with `Unknown command`. Replies only ever go to
//! the issuing peer; the transfer notifies its target by itself.

use crate::{error::LedgerError, ledger::transfer, peer::Peer, registry::Registry};

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Balance,
    Pay { target: String, amount: i64 },
}

impl Command {
    /// Parses one line. Blank lines yield `Ok(None)`.
    ///
    /// Tokens after the amount are ignored.
    pub fn parse(line: &str) -> Result<Option<Self>, LedgerError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&name) = parts.first() else {
            return Ok(None);
        };

        match name {
            "balance" => Ok(Some(Command::Balance)),
            "Pay" if parts.len() < 3 => Err(LedgerError::PayUsage),
            "Pay" => {
                let amount = parse_amount(parts[2])?;
                Ok(Some(Command::Pay {
                    target: parts[1].to_string(),
                    amount,
                }))
            }
            _ => Err(LedgerError::UnknownCommand),
        }
    }
}

fn parse_amount(token: &str) -> Result<i64, LedgerError> {
    match token.parse::<i64>() {
        Ok(amount) if amount > 0 => Ok(amount),
        _ => Err(LedgerError::InvalidAmount),
    }
}

/// Runs one command line on behalf of `peer`, queueing the reply on its outbox.
pub async fn process_command(registry: &Registry, peer: &Peer, line: &str) {
    let outcome = match Command::parse(line) {
        Ok(None) => return,
        Ok(Some(Command::Balance)) => {
            peer.send_line(format!("Balance: {}", peer.balance())).await;
            return;
        }
        Ok(Some(Command::Pay { target, amount })) => {
            transfer(registry, peer, &target, amount).await
        }
        Err(err) => Err(err),
    };

    if let Err(err) = outcome {
        peer.send_line(err.to_string()).await;
    }
}
