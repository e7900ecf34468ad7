use std::collections::{HashSet, VecDeque};

use super::types::{AccessAttempt, AccessStats, AccessType};

/// Folds the access-attempt stream into running daily counters and a
/// bounded newest-first buffer of recent events.
#[derive(Debug)]
pub struct AccessEventAggregator {
    stats: AccessStats,
    /// Newest first; evicted strictly FIFO by insertion order
    recent: VecDeque<AccessAttempt>,
    /// Ids already folded in. Retained after buffer eviction so a
    /// replayed attempt is never double-counted.
    seen: HashSet<String>,
    capacity: usize,
}

impl AccessEventAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            stats: AccessStats::default(),
            recent: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Fold one attempt into the counters and the recent buffer.
    /// Idempotent per attempt id; returns false for a duplicate.
    pub fn record(&mut self, attempt: AccessAttempt) -> bool {
        if !self.seen.insert(attempt.id.clone()) {
            return false;
        }

        let total = self.stats.total_today as f64;
        self.stats.average_confidence =
            (self.stats.average_confidence * total + attempt.confidence_score) / (total + 1.0);
        self.stats.total_today += 1;

        if attempt.success {
            self.stats.successful_today += 1;
            match attempt.access_type {
                AccessType::Entry => self.stats.currently_inside += 1,
                AccessType::Exit => {
                    self.stats.currently_inside = self.stats.currently_inside.saturating_sub(1)
                }
                AccessType::Denied => {}
            }
        } else {
            self.stats.denied_today += 1;
        }

        self.recent.push_front(attempt);
        while self.recent.len() > self.capacity {
            self.recent.pop_back();
        }

        true
    }

    /// Replace all in-memory state from the authoritative endpoint.
    /// A full replace, never a merge, so locally-observed counts cannot
    /// drift away from the server's.
    pub fn bulk_load(&mut self, attempts: Vec<AccessAttempt>, stats: AccessStats) {
        self.seen = attempts.iter().map(|a| a.id.clone()).collect();
        self.recent = attempts.into_iter().take(self.capacity).collect();
        self.stats = stats;
    }

    pub fn stats(&self) -> AccessStats {
        self.stats.clone()
    }

    /// Counters plus the recent buffer, newest first
    pub fn snapshot(&self) -> (AccessStats, Vec<AccessAttempt>) {
        (self.stats.clone(), self.recent.iter().cloned().collect())
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }
}
