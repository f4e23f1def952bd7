//! Request/response correlation.

use crate::envelope::Envelope;
use crate::error::{ClientError, Result};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Events that never get a correlated reply. They are written without a
/// ticket and resolve to `None` immediately.
pub const NO_RESPONSE_EVENTS: &[&str] = &["cpu.stepping", "cpu.resume"];

/// Whether `event` is sent fire-and-forget.
pub fn is_fire_and_forget(event: &str) -> bool {
    NO_RESPONSE_EVENTS.contains(&event)
}

/// Receiving end of a pending request.
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Envelope>>;

type ReplySender = oneshot::Sender<Result<Envelope>>;

/// Requests awaiting a reply, keyed by ticket.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    slots: HashMap<String, ReplySender>,
}

impl PendingRequests {
    pub(crate) fn contains(&self, ticket: &str) -> bool {
        self.slots.contains_key(ticket)
    }

    pub(crate) fn register(&mut self, ticket: String) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(ticket, tx);
        rx
    }

    /// Complete the request for `reply.ticket`. Hands the reply back if no
    /// request is waiting on that ticket.
    pub(crate) fn resolve(
        &mut self,
        ticket: &str,
        reply: Envelope,
    ) -> std::result::Result<(), Envelope> {
        let Some(tx) = self.slots.remove(ticket) else {
            return Err(reply);
        };
        let outcome = if reply.is_error() {
            Err(ClientError::from_reply(reply))
        } else {
            Ok(reply)
        };
        // The caller may have dropped its future; that is fine.
        let _ = tx.send(outcome);
        Ok(())
    }

    /// Remove every pending request, leaving the table empty.
    pub(crate) fn drain(&mut self) -> FailedRequests {
        FailedRequests {
            slots: std::mem::take(&mut self.slots),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// A frozen set of requests removed by [`PendingRequests::drain`].
///
/// Completed outside the session lock.
#[derive(Debug, Default)]
pub(crate) struct FailedRequests {
    slots: HashMap<String, ReplySender>,
}

impl FailedRequests {
    /// Reject every request with the same disconnect error.
    pub(crate) fn fail(self, message: &str) -> usize {
        let count = self.slots.len();
        for (_, tx) in self.slots {
            let _ = tx.send(Err(ClientError::Disconnected {
                message: message.to_string(),
            }));
        }
        count
    }
}
