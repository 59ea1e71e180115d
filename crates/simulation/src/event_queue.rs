//! Time-ordered event queue.

use lockstep_messages::Envelope;
use lockstep_types::SiteId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Tie-break for events scheduled at the same instant.
///
/// Fault detection runs before deliveries so a site never handles mail from
/// a peer it is about to learn is dead in the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventPriority {
    Fault,
    Delivery,
    Timer,
    Client,
}

/// Position of an event in the queue.
///
/// Ordered by time, then priority, then target node, then insertion order,
/// which makes the processing order a pure function of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node: SiteId,
    pub seq: u64,
}

/// Something that happens to `EventKey::node` at `EventKey::time`.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message arrives.
    Deliver(Envelope),
    /// An initiator's heartbeat timer fires.
    HeartbeatTimer,
    /// The workload submits its next batch.
    WorkloadTimer,
    /// The fault detector tells the node about dead sites.
    FaultDetected { failed: BTreeSet<SiteId> },
    /// The node dies.
    Kill,
}

/// Pending events and the simulated clock.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<EventKey, Event>,
    next_seq: u64,
    now: Duration,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule an event. Times in the past are moved to now.
    pub fn schedule(
        &mut self,
        at: Duration,
        priority: EventPriority,
        node: SiteId,
        event: Event,
    ) -> EventKey {
        let key = EventKey {
            time: at.max(self.now),
            priority,
            node,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.events.insert(key, event);
        key
    }

    /// Time of the next event.
    pub fn peek_time(&self) -> Option<Duration> {
        self.events.first_key_value().map(|(key, _)| key.time)
    }

    /// Remove the next event and advance the clock to it.
    pub fn pop(&mut self) -> Option<(EventKey, Event)> {
        let (key, event) = self.events.pop_first()?;
        self.now = key.time;
        Some((key, event))
    }

    /// Move the clock forward without processing anything.
    pub fn advance_to(&mut self, time: Duration) {
        self.now = self.now.max(time);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_pop_in_key_order() {
        let mut queue = EventQueue::new();
        let ms = Duration::from_millis;
        queue.schedule(ms(5), EventPriority::Delivery, SiteId(2), Event::Kill);
        queue.schedule(ms(5), EventPriority::Fault, SiteId(9), Event::Kill);
        queue.schedule(ms(1), EventPriority::Timer, SiteId(1), Event::HeartbeatTimer);
        queue.schedule(ms(5), EventPriority::Delivery, SiteId(2), Event::WorkloadTimer);

        let order: Vec<(Duration, SiteId)> = std::iter::from_fn(|| queue.pop())
            .map(|(key, _)| (key.time, key.node))
            .collect();
        assert_eq!(
            order,
            vec![
                (ms(1), SiteId(1)),
                (ms(5), SiteId(9)),
                (ms(5), SiteId(2)),
                (ms(5), SiteId(2)),
            ]
        );
        assert_eq!(queue.now(), ms(5));
    }

    #[test]
    fn test_past_events_are_scheduled_now() {
        let mut queue = EventQueue::new();
        queue.advance_to(Duration::from_millis(10));
        let key = queue.schedule(
            Duration::from_millis(3),
            EventPriority::Client,
            SiteId(1),
            Event::WorkloadTimer,
        );
        assert_eq!(key.time, Duration::from_millis(10));
        assert_eq!(queue.peek_time(), Some(Duration::from_millis(10)));
    }
}
