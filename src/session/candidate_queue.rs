//! Per-link buffer for ICE candidates that cannot be forwarded yet.

use crate::media::IceCandidate;

/// Candidates held back until their precondition is met: an offer on the
/// wire for the outbound queue, an applied remote description for the
/// inbound one. Insertion order is preserved; nothing is deduplicated or
/// dropped.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    buffered: Vec<IceCandidate>,
}

impl CandidateQueue {
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.buffered.push(candidate);
    }

    /// Empties the queue, returning its contents in arrival order. Draining
    /// an empty queue is a no-op yielding an empty batch.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.buffered)
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 203.0.113.7 {} typ host", 40000 + n),
            sdp_mline_index: 0,
            sdp_mid: "0".into(),
        }
    }

    #[test]
    fn drain_preserves_arrival_order_and_clears() {
        let mut queue = CandidateQueue::default();
        queue.enqueue(candidate(1));
        queue.enqueue(candidate(2));
        queue.enqueue(candidate(3));

        let drained = queue.drain();
        assert_eq!(drained, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn draining_empty_queue_is_a_noop() {
        let mut queue = CandidateQueue::default();
        assert!(queue.drain().is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn duplicates_are_kept() {
        let mut queue = CandidateQueue::default();
        queue.enqueue(candidate(7));
        queue.enqueue(candidate(7));
        assert_eq!(queue.drain().len(), 2);
    }
}
