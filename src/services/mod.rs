//! The services bridge.
//!
//! Services is not a separate transport: it is the peer at the far end
//! of one designated S2S link. This module tracks which peer that is,
//! the mechanism list and VAPID key it broadcast, and a bounded queue
//! of metadata writes to replay when the peer returns.

pub mod metadata;
pub mod sasl;
pub mod webpush;

use std::collections::VecDeque;

use kestrel_p10::{Frame, ServerNumeric};

use crate::state::Network;

/// State of the link to the services collaborator.
pub struct ServicesBridge {
    /// Configured peer name, or `*` for the nearest self-announced
    /// services server.
    pub configured: String,
    /// The resolved services peer, when one is linked.
    pub peer: Option<ServerNumeric>,
    /// Advertised SASL mechanism list; empty while unreachable.
    pub mechs: String,
    /// VAPID public key broadcast by services.
    pub vapid: Option<String>,
    /// Metadata writes parked while services are down (oldest-drop).
    queue: VecDeque<Frame>,
    queue_cap: usize,
}

impl ServicesBridge {
    /// Bridge for the configured peer selector.
    pub fn new(configured: String, queue_cap: usize) -> Self {
        Self {
            configured,
            peer: None,
            mechs: String::new(),
            vapid: None,
            queue: VecDeque::new(),
            queue_cap,
        }
    }

    /// True when a services peer is linked.
    pub fn available(&self) -> bool {
        self.peer.is_some()
    }

    /// Does this server match the configured selector?
    pub fn matches(&self, name: &str, is_services: bool) -> bool {
        if self.configured == "*" {
            is_services
        } else {
            self.configured.eq_ignore_ascii_case(name)
        }
    }

    /// Re-resolve the peer after a link or squit. Returns true when the
    /// peer changed.
    pub fn resolve(&mut self, net: &Network) -> bool {
        let next = net
            .servers
            .values()
            .filter(|s| s.numeric != net.me)
            .find(|s| self.matches(&s.name, s.is_services))
            .map(|s| s.numeric);
        let changed = next != self.peer;
        self.peer = next;
        if self.peer.is_none() {
            self.mechs.clear();
        }
        changed
    }

    /// Park a frame for replay; the oldest entry drops when full.
    pub fn enqueue(&mut self, frame: Frame) {
        if self.queue.len() >= self.queue_cap {
            self.queue.pop_front();
        }
        self.queue.push_back(frame);
    }

    /// Take everything parked for replay.
    pub fn drain(&mut self) -> Vec<Frame> {
        self.queue.drain(..).collect()
    }

    /// How many writes are parked.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_services_flag_only() {
        let bridge = ServicesBridge::new("*".into(), 8);
        assert!(bridge.matches("anything.example", true));
        assert!(!bridge.matches("anything.example", false));
    }

    #[test]
    fn named_selector_matches_name() {
        let bridge = ServicesBridge::new("services.kestrel.example".into(), 8);
        assert!(bridge.matches("Services.Kestrel.Example", false));
        assert!(!bridge.matches("other.example", true));
    }

    #[test]
    fn queue_drops_oldest() {
        let mut bridge = ServicesBridge::new("*".into(), 2);
        bridge.enqueue(Frame::new("MD").with_param("one"));
        bridge.enqueue(Frame::new("MD").with_param("two"));
        bridge.enqueue(Frame::new("MD").with_param("three"));
        let drained = bridge.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].params[0], "two");
    }
}
