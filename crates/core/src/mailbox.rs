//! The mailbox seam between a site and the transport.

use lockstep_messages::{Envelope, SiteMessage, Subject};
use lockstep_types::SiteId;
use std::time::Duration;

/// Addressable per-site queue.
///
/// Delivery is FIFO per sender; there is no ordering between different
/// senders. Sends never block and never fail from the caller's point of
/// view: a message to a dead or unknown site is dropped, and the fault
/// protocol is what eventually tells the sender.
pub trait Mailbox {
    /// Site this mailbox belongs to.
    fn site_id(&self) -> SiteId;

    /// Send a message to one site.
    fn send(&mut self, to: SiteId, message: SiteMessage);

    /// Send a copy of a message to each listed site.
    fn send_many(&mut self, to: &[SiteId], message: SiteMessage) {
        for site in to {
            self.send(*site, message.clone());
        }
    }

    /// Take the next message if one is available.
    fn recv(&mut self) -> Option<Envelope>;

    /// Wait up to `timeout` for the next message.
    fn recv_blocking(&mut self, timeout: Duration) -> Option<Envelope>;

    /// Take the oldest available message whose subject is listed.
    ///
    /// Messages with other subjects stay queued, in order, for later receives.
    fn recv_subject(&mut self, subjects: &[Subject]) -> Option<Envelope>;
}
