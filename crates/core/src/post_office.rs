//! Channel-backed production mailboxes.
//!
//! A [`PostOffice`] is the explicit registry of site addresses. Each
//! registered site gets a [`ChannelMailbox`] that owns the receiving end of an
//! unbounded crossbeam channel and shares the routing table with every other
//! mailbox from the same post office.

use crate::Mailbox;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use lockstep_messages::{Envelope, SiteMessage, Subject};
use lockstep_types::SiteId;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

/// Errors registering mailboxes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// The site already has a mailbox.
    #[error("site {0} already has a mailbox")]
    AlreadyRegistered(SiteId),
}

type Routes = Arc<RwLock<HashMap<SiteId, Sender<Envelope>>>>;

/// Registry of site addresses.
#[derive(Clone, Default)]
pub struct PostOffice {
    routes: Routes,
}

impl PostOffice {
    /// Create an empty post office.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site and return its mailbox.
    pub fn register(&self, site_id: SiteId) -> Result<ChannelMailbox, MailboxError> {
        let mut routes = self.routes.write();
        if routes.contains_key(&site_id) {
            return Err(MailboxError::AlreadyRegistered(site_id));
        }
        let (tx, rx) = channel::unbounded();
        routes.insert(site_id, tx);
        Ok(ChannelMailbox {
            site_id,
            receiver: rx,
            routes: Arc::clone(&self.routes),
            deferred: VecDeque::new(),
        })
    }

    /// Remove a site's address; later sends to it are dropped.
    pub fn unregister(&self, site_id: SiteId) {
        self.routes.write().remove(&site_id);
    }

    /// Deliver a message from outside any mailbox (failure detector, tests).
    pub fn post(&self, from: SiteId, to: SiteId, message: SiteMessage) -> bool {
        match self.routes.read().get(&to) {
            Some(tx) => tx.send(Envelope::new(from, message)).is_ok(),
            None => false,
        }
    }

    /// Number of registered sites.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether no sites are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Mailbox backed by crossbeam channels.
pub struct ChannelMailbox {
    site_id: SiteId,
    receiver: Receiver<Envelope>,
    routes: Routes,
    /// Messages skipped by a subject-filtered receive, in arrival order.
    deferred: VecDeque<Envelope>,
}

impl ChannelMailbox {
    fn take_deferred_matching(&mut self, subjects: &[Subject]) -> Option<Envelope> {
        let index = self
            .deferred
            .iter()
            .position(|env| subjects.contains(&env.message.subject()))?;
        self.deferred.remove(index)
    }
}

impl Mailbox for ChannelMailbox {
    fn site_id(&self) -> SiteId {
        self.site_id
    }

    fn send(&mut self, to: SiteId, message: SiteMessage) {
        let routes = self.routes.read();
        match routes.get(&to) {
            Some(tx) => {
                trace!(from = %self.site_id, to = %to, msg = message.type_name(), "send");
                if tx.send(Envelope::new(self.site_id, message)).is_err() {
                    warn!(from = %self.site_id, to = %to, "Destination mailbox closed, dropping");
                }
            }
            None => {
                warn!(from = %self.site_id, to = %to, msg = message.type_name(), "No route, dropping");
            }
        }
    }

    fn recv(&mut self) -> Option<Envelope> {
        if let Some(env) = self.deferred.pop_front() {
            return Some(env);
        }
        match self.receiver.try_recv() {
            Ok(env) => Some(env),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn recv_blocking(&mut self, timeout: Duration) -> Option<Envelope> {
        if let Some(env) = self.deferred.pop_front() {
            return Some(env);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(env) => Some(env),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn recv_subject(&mut self, subjects: &[Subject]) -> Option<Envelope> {
        if let Some(env) = self.take_deferred_matching(subjects) {
            return Some(env);
        }
        while let Ok(env) = self.receiver.try_recv() {
            if subjects.contains(&env.message.subject()) {
                return Some(env);
            }
            self.deferred.push_back(env);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_messages::{HeartbeatMessage, SiteFailureFault};
    use lockstep_types::TxnId;

    fn heartbeat(id: u64) -> SiteMessage {
        SiteMessage::Heartbeat(HeartbeatMessage {
            initiator_id: SiteId(9),
            txn_id: TxnId(id),
            safe_txn_id: TxnId::NONE,
        })
    }

    #[test]
    fn test_send_and_receive_in_order() {
        let office = PostOffice::new();
        let mut a = office.register(SiteId(1)).unwrap();
        let mut b = office.register(SiteId(2)).unwrap();

        a.send(SiteId(2), heartbeat(1));
        a.send(SiteId(2), heartbeat(2));

        let first = b.recv().unwrap();
        assert_eq!(first.source, SiteId(1));
        assert_eq!(first.message.txn_id(), Some(TxnId(1)));
        assert_eq!(b.recv().unwrap().message.txn_id(), Some(TxnId(2)));
        assert!(b.recv().is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let office = PostOffice::new();
        let _a = office.register(SiteId(1)).unwrap();
        assert_eq!(
            office.register(SiteId(1)).err(),
            Some(MailboxError::AlreadyRegistered(SiteId(1)))
        );
    }

    #[test]
    fn test_subject_filter_keeps_other_messages_queued() {
        let office = PostOffice::new();
        let mut a = office.register(SiteId(1)).unwrap();
        let mut b = office.register(SiteId(2)).unwrap();

        a.send(SiteId(2), heartbeat(1));
        a.send(
            SiteId(2),
            SiteMessage::SiteFailure(SiteFailureFault::new([SiteId(7)])),
        );
        a.send(SiteId(2), heartbeat(2));

        let fault = b.recv_subject(&[Subject::Fault]).unwrap();
        assert!(fault.message.is_fault());
        assert!(b.recv_subject(&[Subject::Fault]).is_none());

        // Skipped messages come back in their original order.
        assert_eq!(b.recv().unwrap().message.txn_id(), Some(TxnId(1)));
        assert_eq!(b.recv().unwrap().message.txn_id(), Some(TxnId(2)));
    }

    #[test]
    fn test_send_to_unregistered_site_is_dropped() {
        let office = PostOffice::new();
        let mut a = office.register(SiteId(1)).unwrap();
        let mut b = office.register(SiteId(2)).unwrap();
        office.unregister(SiteId(2));

        a.send(SiteId(2), heartbeat(1));
        assert!(b.recv().is_none());
        assert!(!office.post(SiteId(1), SiteId(2), heartbeat(2)));
    }

    #[test]
    fn test_send_many_and_blocking_receive_across_threads() {
        let office = PostOffice::new();
        let mut a = office.register(SiteId(1)).unwrap();
        let mut b = office.register(SiteId(2)).unwrap();
        let mut c = office.register(SiteId(3)).unwrap();

        let handle = std::thread::spawn(move || {
            let env = b.recv_blocking(Duration::from_secs(5));
            env.map(|e| e.source)
        });

        a.send_many(&[SiteId(2), SiteId(3)], heartbeat(4));
        assert_eq!(handle.join().unwrap(), Some(SiteId(1)));
        assert_eq!(c.recv().unwrap().message.txn_id(), Some(TxnId(4)));
        assert_eq!(office.len(), 3);
    }
}
