//! TCP handshake RTT sampling
//!
//! A SYN remembers when the connection was opened; the SYN-ACK travelling
//! the other way completes the sample. The sample lands on the flow the
//! SYN-ACK belongs to, which is created by that very packet.

use flow_common::{
    constants::{ACK_FLAG, SYN_ACK_FLAG, SYN_FLAG},
    FlowKey,
};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError, TryLockError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandshakeKey {
    client_ip: [u8; 16],
    server_ip: [u8; 16],
    client_port: u16,
    server_port: u16,
}

/// Bounded table of half-open TCP handshakes
pub struct RttTracker {
    handshakes: Mutex<HashMap<HandshakeKey, u64>>,
    max_handshakes: usize,
}

impl RttTracker {
    pub fn new(max_handshakes: usize) -> Self {
        Self {
            handshakes: Mutex::new(HashMap::with_capacity(max_handshakes)),
            max_handshakes,
        }
    }

    /// Inspect a TCP packet's flags; returns an RTT when it completes a handshake
    ///
    /// Never waits: a busy tracker skips the packet.
    pub fn track(&self, key: &FlowKey, flags: u16, timestamp_ns: u64) -> Option<u64> {
        if !key.is_tcp() {
            return None;
        }
        let is_syn = flags & SYN_FLAG != 0 && flags & ACK_FLAG == 0;
        let is_syn_ack = flags & SYN_ACK_FLAG != 0;
        if !is_syn && !is_syn_ack {
            return None;
        }

        let mut handshakes = match self.handshakes.try_lock() {
            Ok(handshakes) => handshakes,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if is_syn {
            let handshake = HandshakeKey {
                client_ip: key.src_ip,
                server_ip: key.dst_ip,
                client_port: key.src_port,
                server_port: key.dst_port,
            };
            if handshakes.len() < self.max_handshakes || handshakes.contains_key(&handshake) {
                handshakes.insert(handshake, timestamp_ns);
            }
            return None;
        }

        let handshake = HandshakeKey {
            client_ip: key.dst_ip,
            server_ip: key.src_ip,
            client_port: key.dst_port,
            server_port: key.src_port,
        };
        handshakes
            .remove(&handshake)
            .map(|sent_at| timestamp_ns.saturating_sub(sent_at))
    }

    /// Handshakes still waiting for a SYN-ACK
    pub fn pending(&self) -> usize {
        self.handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget handshakes older than `timeout_ns`; returns how many were removed
    pub fn evict_stale(&self, now_ns: u64, timeout_ns: u64) -> usize {
        let mut handshakes = self.handshakes.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handshakes.len();
        handshakes.retain(|_, sent_at| now_ns.saturating_sub(*sent_at) < timeout_ns);
        before - handshakes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_frame, test_frames::*};
    use flow_common::Direction;

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn observe(tracker: &RttTracker, frame: &[u8], ts: u64) -> Option<u64> {
        let parsed = parse_frame(frame, frame.len() as u32, ts, 1, Direction::Ingress).unwrap();
        tracker.track(&parsed.key, parsed.meta.flags, ts)
    }

    #[test]
    fn test_handshake_rtt() {
        let tracker = RttTracker::new(16);
        let syn = ipv4_tcp(CLIENT, 40000, SERVER, 443, 0x02, 0);
        let syn_ack = ipv4_tcp(SERVER, 443, CLIENT, 40000, 0x12, 0);

        assert_eq!(observe(&tracker, &syn, 1_000), None);
        assert_eq!(tracker.pending(), 1);
        assert_eq!(observe(&tracker, &syn_ack, 181_000), Some(180_000));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_other_packets_ignored() {
        let tracker = RttTracker::new(16);
        let ack = ipv4_tcp(CLIENT, 40000, SERVER, 443, 0x10, 0);
        let udp = ipv4_udp(CLIENT, 40000, SERVER, 443, &[]);
        let stray_syn_ack = ipv4_tcp(SERVER, 443, CLIENT, 40001, 0x12, 0);

        assert_eq!(observe(&tracker, &ack, 1), None);
        assert_eq!(observe(&tracker, &udp, 1), None);
        assert_eq!(observe(&tracker, &stray_syn_ack, 1), None);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_bounded_and_evicted() {
        let tracker = RttTracker::new(1);
        observe(&tracker, &ipv4_tcp(CLIENT, 1, SERVER, 443, 0x02, 0), 100);
        observe(&tracker, &ipv4_tcp(CLIENT, 2, SERVER, 443, 0x02, 0), 200);
        assert_eq!(tracker.pending(), 1);

        assert_eq!(tracker.evict_stale(10_000, 1_000), 1);
        assert_eq!(tracker.pending(), 0);
    }
}
