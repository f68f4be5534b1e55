use crate::{CorrelationId, Envelope};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Calls waiting for their reply, keyed by correlation id.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationId, oneshot::Sender<Envelope>>,
}

impl PendingCalls {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a call and return the receiver its reply will arrive on.
    pub fn register(&mut self, correlation_id: CorrelationId) -> oneshot::Receiver<Envelope> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(correlation_id, tx);
        rx
    }

    /// Deliver a reply. Returns false when nobody is waiting for
    /// `correlation_id` any more (late or foreign reply).
    pub fn complete(&mut self, correlation_id: &CorrelationId, reply: Envelope) -> bool {
        // ---
        match self.calls.remove(correlation_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Forget a call without delivering anything. Used on timeout.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    /// Drop every waiting call; their receivers observe a closed channel.
    pub fn fail_all(&mut self) -> usize {
        // ---
        let n = self.calls.len();
        self.calls.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::Address;
    use bytes::Bytes;

    fn reply(body: &'static [u8]) -> Envelope {
        Envelope::response(Address::from("client"), Bytes::from_static(body), None)
    }

    #[test]
    fn register_and_complete() {
        // ---
        let mut pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let rx = pending.register(correlation_id.clone());
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(&correlation_id, reply(b"reply")));
        assert_eq!(pending.len(), 0);

        assert_eq!(&rx.blocking_recv().unwrap().payload[..], b"reply");
    }

    #[test]
    fn remove_is_single_shot() {
        // ---
        let mut pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let _rx = pending.register(correlation_id.clone());
        assert!(pending.remove(&correlation_id));
        assert!(!pending.remove(&correlation_id));
        assert!(!pending.complete(&correlation_id, reply(b"")));
    }

    #[test]
    fn fail_all_closes_receivers() {
        // ---
        let mut pending = PendingCalls::new();
        let rx = pending.register(CorrelationId::from("a"));
        let _rx2 = pending.register(CorrelationId::from("b"));

        assert_eq!(pending.fail_all(), 2);
        assert!(rx.blocking_recv().is_err());
    }
}
