use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::NetplayEvent;

/// Drains the [`NetplayEvent`]s a session queued for the orchestrator.
///
/// Obtained from [`NetplaySession::events`](crate::NetplaySession::events). Events are
/// yielded oldest first, and dropping the drain discards whatever was not consumed.
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         NetplayEvent::StateChanged { to, .. } => overlay.show_phase(to),
///         NetplayEvent::Error { message } => overlay.show_error(&message),
///         _ => {},
///     }
/// }
/// ```
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a, A> {
    drain: Drain<'a, NetplayEvent<A>>,
}

impl<'a, A> EventDrain<'a, A> {
    pub(crate) fn from_drain(drain: Drain<'a, NetplayEvent<A>>) -> Self {
        Self { drain }
    }
}

impl<A> Iterator for EventDrain<'_, A> {
    type Item = NetplayEvent<A>;

    fn next(&mut self) -> Option<Self::Item> {
        self.drain.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.drain.size_hint()
    }
}

impl<A> DoubleEndedIterator for EventDrain<'_, A> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.drain.next_back()
    }
}

impl<A> ExactSizeIterator for EventDrain<'_, A> {
    fn len(&self) -> usize {
        self.drain.len()
    }
}

impl<A> FusedIterator for EventDrain<'_, A> {}

impl<A> std::fmt::Debug for EventDrain<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn queue() -> VecDeque<NetplayEvent<u32>> {
        let mut queue = VecDeque::new();
        queue.push_back(NetplayEvent::DataConnected { addr: 1 });
        queue.push_back(NetplayEvent::SpectatorLeft { addr: 2 });
        queue.push_back(NetplayEvent::Stopped);
        queue
    }

    #[test]
    fn drain_yields_oldest_first() {
        let mut queue = queue();
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], NetplayEvent::DataConnected { addr: 1 });
        assert_eq!(events[2], NetplayEvent::Stopped);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_reports_exact_len() {
        let mut queue = queue();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 3);
        drain.next();
        assert_eq!(drain.len(), 2);
        assert_eq!(drain.next_back(), Some(NetplayEvent::Stopped));
        assert_eq!(drain.len(), 1);
    }

    #[test]
    fn dropped_drain_discards_rest() {
        let mut queue = queue();
        {
            let mut drain = EventDrain::from_drain(queue.drain(..));
            drain.next();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn debug_shows_remaining() {
        let mut queue = queue();
        let drain = EventDrain::from_drain(queue.drain(..));
        assert!(format!("{drain:?}").contains("remaining: 3"));
    }

    #[test]
    fn drain_is_fused() {
        let mut queue = VecDeque::<NetplayEvent<u32>>::new();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }
}
