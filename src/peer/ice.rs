use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::debug;

/// Remote candidates received before the remote description is applied.
///
/// The gate opens once, when the remote description is set; after that
/// `drain_if_ready` hands back everything queued, oldest first.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate; it is never applied from here directly
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
        debug!("Remote description not set yet, queued candidate ({} pending)", self.pending.len());
    }

    /// Mark the remote description as applied
    pub fn open(&mut self) {
        self.remote_description_set = true;
    }

    pub fn is_open(&self) -> bool {
        self.remote_description_set
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns queued candidates in arrival order once the gate is open.
    /// While closed this is a no-op and returns nothing.
    pub fn drain_if_ready(&mut self) -> Vec<IceCandidate> {
        if !self.remote_description_set {
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    /// Drop everything, used on session teardown
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        }
    }

    #[test]
    fn closed_gate_returns_nothing() {
        let mut buf = CandidateBuffer::new();
        buf.push(cand(1));
        buf.push(cand(2));
        assert!(buf.drain_if_ready().is_empty());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let mut buf = CandidateBuffer::new();
        let received: Vec<_> = (1..=7).map(cand).collect();
        for c in &received {
            buf.push(c.clone());
        }
        buf.open();
        assert_eq!(buf.drain_if_ready(), received);
        assert!(buf.is_empty());
        assert!(buf.drain_if_ready().is_empty());
    }

    #[test]
    fn clear_discards_pending() {
        let mut buf = CandidateBuffer::new();
        buf.push(cand(1));
        buf.clear();
        buf.open();
        assert!(buf.drain_if_ready().is_empty());
    }
}
