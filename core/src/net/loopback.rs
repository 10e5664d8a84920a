//! In-memory transport for tests and soak runs
//!
//! A `LoopbackNetwork` routes payloads between endpoints living in the same
//! process. Each directed link delivers in order after a fixed latency plus
//! optional jitter; jitter never reorders a link because delivery times are
//! kept monotonic per link.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use rand::Rng;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::input::PlayerId;

use super::transport::{Transport, TransportError, TransportEvent};

/// Link characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkProfile {
    /// One-way latency
    pub latency: Duration,
    /// Maximum extra random delay per payload
    pub jitter: Duration,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

struct Pending {
    deliver_at: Instant,
    event: TransportEvent,
}

struct NetworkInner {
    profile: LinkProfile,
    rng: StdRng,
    links: HashSet<(PlayerId, PlayerId)>,
    inboxes: HashMap<PlayerId, VecDeque<Pending>>,
    last_delivery: HashMap<(PlayerId, PlayerId), Instant>,
    bytes_sent: u64,
    messages_sent: u64,
}

impl NetworkInner {
    fn enqueue(&mut self, from: PlayerId, to: PlayerId, now: Instant, event: TransportEvent) {
        let jitter_ns = self.profile.jitter.as_nanos() as u64;
        let jitter = if jitter_ns > 0 {
            Duration::from_nanos(self.rng.random_range(0..=jitter_ns))
        } else {
            Duration::ZERO
        };
        let mut deliver_at = now + self.profile.latency + jitter;
        // Keep each link FIFO
        if let Some(last) = self.last_delivery.get(&(from, to))
            && *last > deliver_at
        {
            deliver_at = *last;
        }
        self.last_delivery.insert((from, to), deliver_at);
        self.inboxes
            .entry(to)
            .or_default()
            .push_back(Pending { deliver_at, event });
    }
}

/// Shared in-process network
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Rc<RefCell<NetworkInner>>,
    clock: Rc<RefCell<Instant>>,
}

impl LoopbackNetwork {
    /// Create a network with the given link profile and jitter seed
    pub fn new(profile: LinkProfile, seed: u64, start: Instant) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetworkInner {
                profile,
                rng: StdRng::seed_from_u64(seed),
                links: HashSet::new(),
                inboxes: HashMap::new(),
                last_delivery: HashMap::new(),
                bytes_sent: 0,
                messages_sent: 0,
            })),
            clock: Rc::new(RefCell::new(start)),
        }
    }

    /// Advance the network clock used to stamp outgoing payloads
    pub fn set_now(&self, now: Instant) {
        *self.clock.borrow_mut() = now;
    }

    /// Create an endpoint for `id`
    pub fn endpoint(&self, id: PlayerId) -> LoopbackTransport {
        self.inner.borrow_mut().inboxes.entry(id).or_default();
        LoopbackTransport {
            id,
            network: self.clone(),
        }
    }

    /// Open a bidirectional channel between two endpoints
    pub fn connect(&self, a: PlayerId, b: PlayerId) {
        let now = *self.clock.borrow();
        let mut inner = self.inner.borrow_mut();
        if !inner.links.insert((a, b)) {
            return;
        }
        inner.links.insert((b, a));
        inner.enqueue(b, a, now, TransportEvent::Connected(b));
        inner.enqueue(a, b, now, TransportEvent::Connected(a));
    }

    /// Close the channel between two endpoints, notifying both sides
    pub fn sever(&self, a: PlayerId, b: PlayerId) {
        let now = *self.clock.borrow();
        let mut inner = self.inner.borrow_mut();
        if !inner.links.remove(&(a, b)) {
            return;
        }
        inner.links.remove(&(b, a));
        inner.enqueue(b, a, now, TransportEvent::Disconnected(b));
        inner.enqueue(a, b, now, TransportEvent::Disconnected(a));
    }

    /// Total payload bytes sent so far
    pub fn bytes_sent(&self) -> u64 {
        self.inner.borrow().bytes_sent
    }

    /// Total payloads sent so far
    pub fn messages_sent(&self) -> u64 {
        self.inner.borrow().messages_sent
    }
}

/// One endpoint on a `LoopbackNetwork`
pub struct LoopbackTransport {
    id: PlayerId,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    /// Player id this endpoint belongs to
    pub fn id(&self) -> PlayerId {
        self.id
    }
}

impl Transport for LoopbackTransport {
    fn send_to(&mut self, peer: PlayerId, payload: &[u8]) -> Result<(), TransportError> {
        let now = *self.network.clock.borrow();
        let mut inner = self.network.inner.borrow_mut();
        if !inner.links.contains(&(self.id, peer)) {
            return Err(TransportError::UnknownPeer(peer));
        }
        inner.bytes_sent += payload.len() as u64;
        inner.messages_sent += 1;
        inner.enqueue(
            self.id,
            peer,
            now,
            TransportEvent::Message {
                from: self.id,
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }

    fn broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        for peer in self.peers() {
            self.send_to(peer, payload)?;
        }
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> Vec<TransportEvent> {
        let mut inner = self.network.inner.borrow_mut();
        let Some(inbox) = inner.inboxes.get_mut(&self.id) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while inbox.front().is_some_and(|pending| pending.deliver_at <= now) {
            if let Some(pending) = inbox.pop_front() {
                events.push(pending.event);
            }
        }
        events
    }

    fn disconnect(&mut self, peer: PlayerId) {
        self.network.sever(self.id, peer);
    }

    fn close_all(&mut self) {
        for peer in self.peers() {
            self.network.sever(self.id, peer);
        }
    }

    fn peers(&self) -> Vec<PlayerId> {
        let inner = self.network.inner.borrow();
        let mut peers: Vec<PlayerId> = inner
            .links
            .iter()
            .filter(|(from, _)| *from == self.id)
            .map(|(_, to)| *to)
            .collect();
        peers.sort_unstable();
        peers
    }
}
