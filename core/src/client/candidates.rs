//! Bounded queue for remote candidates that arrive early

use crate::protocol::IceCandidate;
use std::collections::VecDeque;

/// Candidates held per negotiation before the remote description is known
pub const DEFAULT_CANDIDATE_CAPACITY: usize = 10;

/// FIFO queue that evicts the oldest entry when full
#[derive(Debug, Clone)]
pub struct CandidateQueue {
    items: VecDeque<IceCandidate>,
    capacity: usize,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CANDIDATE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a candidate. Returns the evicted one when the queue was full.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            tracing::warn!("Candidate queue full, evicting {}", old.candidate);
        }
        self.items.push_back(candidate);
        evicted
    }

    /// Take every queued candidate, oldest first
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{}", n))
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = CandidateQueue::new();
        for n in 0..3 {
            assert!(queue.push(candidate(n)).is_none());
        }
        let drained: Vec<String> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["candidate:0", "candidate:1", "candidate:2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_eleventh_evicts_first() {
        let mut queue = CandidateQueue::new();
        for n in 0..10 {
            queue.push(candidate(n));
        }
        let evicted = queue.push(candidate(10));

        assert_eq!(evicted, Some(candidate(0)));
        assert_eq!(queue.len(), 10);
        let drained = queue.drain();
        assert_eq!(drained.first(), Some(&candidate(1)));
        assert_eq!(drained.last(), Some(&candidate(10)));
    }

    #[test]
    fn test_zero_capacity_still_holds_one() {
        let mut queue = CandidateQueue::with_capacity(0);
        queue.push(candidate(0));
        queue.push(candidate(1));
        assert_eq!(queue.drain(), vec![candidate(1)]);
    }
}
