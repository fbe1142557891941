//! Acknowledgement ledger for must-deliver outbound messages.
//!
//! Delivery is at-least-once: a message may hit the wire several times
//! before the server acknowledges it, so ackable messages must be
//! idempotent on the application side.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::envelope::{Outbound, ensure_object};

/// A registered message awaiting server acknowledgement.
#[derive(Debug, Clone)]
struct PendingAck {
    msg_type: String,
    /// Payload including the injected ack id under `a`
    data: Value,
    /// Last (re)send time; resend reuses the record rather than re-registering
    sent_at: Instant,
}

/// Owns the set of outbound messages awaiting acknowledgement.
///
/// Ids are unique and ascending for the registry lifetime; a record is
/// removed exactly once, by a matching ack or registry shutdown.
#[derive(Debug)]
pub struct AckRegistry {
    next_id: u64,
    pending: Vec<PendingAck>,
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AckRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: Vec::new(),
        }
    }

    /// Assign a fresh id, inject it into `data` as `a`, and store the
    /// pending record stamped with `now`. Returns the assigned id.
    pub fn register(&mut self, msg_type: &str, data: &mut Option<Value>, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let obj = ensure_object(data);
        obj.insert("a".to_owned(), Value::from(id));

        self.pending.push(PendingAck {
            msg_type: msg_type.to_owned(),
            data: data.clone().unwrap_or(Value::Null),
            sent_at: now,
        });
        id
    }

    /// Records older than `cutoff` since their last (re)send, restamped
    /// with `now`. Each record appears at most once per pass.
    pub fn due_for_resend(&mut self, now: Instant, cutoff: Duration) -> Vec<Outbound> {
        self.pending
            .iter_mut()
            .filter(|m| now.saturating_duration_since(m.sent_at) > cutoff)
            .map(|m| {
                m.sent_at = now;
                Outbound::new(m.msg_type.clone(), Some(m.data.clone()))
            })
            .collect()
    }

    /// All pending records, restamped with `now`. Used on reconnect, when
    /// server-side state is assumed lost.
    pub fn resend_all(&mut self, now: Instant) -> Vec<Outbound> {
        self.pending
            .iter_mut()
            .map(|m| {
                m.sent_at = now;
                Outbound::new(m.msg_type.clone(), Some(m.data.clone()))
            })
            .collect()
    }

    /// Remove the record matching `id`. Unknown ids are ignored; a late or
    /// duplicate ack is not an error.
    pub fn on_ack(&mut self, id: u64) {
        self.pending
            .retain(|m| m.data.get("a").and_then(Value::as_u64) != Some(id));
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
