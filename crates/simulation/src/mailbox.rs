//! Mailbox used by simulated sites.

use lockstep_core::Mailbox;
use lockstep_messages::{Envelope, SiteMessage, Subject};
use lockstep_types::SiteId;
use std::collections::VecDeque;
use std::time::Duration;

/// A mailbox the runner fills and empties by hand.
///
/// Sends are collected for the runner to route through the simulated
/// network; receives never block.
#[derive(Debug)]
pub struct SimMailbox {
    site_id: SiteId,
    inbox: VecDeque<Envelope>,
    outgoing: Vec<(SiteId, SiteMessage)>,
}

impl SimMailbox {
    pub fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            inbox: VecDeque::new(),
            outgoing: Vec::new(),
        }
    }

    /// Append an arriving message.
    pub fn deliver(&mut self, envelope: Envelope) {
        self.inbox.push_back(envelope);
    }

    /// Everything sent since the last call, in send order.
    pub fn take_outgoing(&mut self) -> Vec<(SiteId, SiteMessage)> {
        std::mem::take(&mut self.outgoing)
    }

    /// Messages delivered but not yet received.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Mailbox for SimMailbox {
    fn site_id(&self) -> SiteId {
        self.site_id
    }

    fn send(&mut self, to: SiteId, message: SiteMessage) {
        self.outgoing.push((to, message));
    }

    fn recv(&mut self) -> Option<Envelope> {
        self.inbox.pop_front()
    }

    fn recv_blocking(&mut self, _timeout: Duration) -> Option<Envelope> {
        self.recv()
    }

    fn recv_subject(&mut self, subjects: &[Subject]) -> Option<Envelope> {
        let index = self
            .inbox
            .iter()
            .position(|env| subjects.contains(&env.message.subject()))?;
        self.inbox.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_messages::{HeartbeatMessage, SiteFailureFault};
    use lockstep_types::TxnId;

    #[test]
    fn test_subject_receive_skips_without_reordering() {
        let mut mailbox = SimMailbox::new(SiteId(1));
        let heartbeat = |txn| {
            SiteMessage::Heartbeat(HeartbeatMessage {
                initiator_id: SiteId(9),
                txn_id: TxnId(txn),
                safe_txn_id: TxnId::NONE,
            })
        };
        mailbox.deliver(Envelope::new(SiteId(9), heartbeat(1)));
        mailbox.deliver(Envelope::new(
            SiteId(0),
            SiteMessage::SiteFailure(SiteFailureFault::new([SiteId(2)])),
        ));
        mailbox.deliver(Envelope::new(SiteId(9), heartbeat(2)));

        let fault = mailbox.recv_subject(&[Subject::Fault]).unwrap();
        assert!(fault.message.is_fault());
        assert_eq!(mailbox.recv().unwrap().message.txn_id(), Some(TxnId(1)));
        assert_eq!(mailbox.recv().unwrap().message.txn_id(), Some(TxnId(2)));
        assert!(mailbox.recv().is_none());

        mailbox.send(SiteId(3), heartbeat(5));
        assert_eq!(mailbox.take_outgoing().len(), 1);
        assert!(mailbox.take_outgoing().is_empty());
    }
}
