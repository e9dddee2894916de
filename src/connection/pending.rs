//! The in-flight request FIFO entry (§3 "pending request").

use std::time::Instant;

use tokio::sync::oneshot;

use crate::command::CommandKind;
use crate::error::ClientError;
use crate::resp::RespToken;

pub type ReplyTx = oneshot::Sender<Result<RespToken, ClientError>>;

pub struct PendingEntry {
    pub id: u64,
    pub reply_tx: Option<ReplyTx>,
    pub deadline: Option<Instant>,
    pub kind: CommandKind,
}

impl PendingEntry {
    /// A cancelled request is one whose receiver was dropped; the entry
    /// stays in the FIFO (so ordering is preserved for the requests behind
    /// it) but its reply is discarded on match (§5 cancellation).
    pub fn is_cancelled(&self) -> bool {
        match &self.reply_tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    pub fn resolve(&mut self, result: Result<RespToken, ClientError>) {
        if let Some(tx) = self.reply_tx.take() {
            let _ = tx.send(result);
        }
    }
}
