//! The seen-message set: recently observed wire message ids.
//!
//! Every inbound and outbound message id is tracked here; an inbound message
//! whose id is already present is dropped without processing, which is what
//! makes retries and broadcast echoes free. Entries age out after `max_age`
//! and a soft cap bounds memory under flood.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::util::TimerMap;

/// Default retention for seen ids.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(9);

/// Soft cap on tracked ids; the oldest entries are evicted past this.
pub const SOFT_CAP: usize = 1000;

#[derive(Debug)]
pub struct Dup {
    /// id → expiry instant of its latest touch.
    entries: HashMap<String, Instant>,
    /// Expiry index; stale slots (from LRU bumps) are skipped on sweep.
    expiry: TimerMap<String>,
    max_age: Duration,
}

impl Dup {
    pub fn new(max_age: Duration) -> Self {
        Dup {
            entries: HashMap::new(),
            expiry: TimerMap::new(),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an id, refreshing it if already present.
    pub fn track(&mut self, id: &str, now: Instant) {
        let expires = now + self.max_age;
        self.entries.insert(id.to_string(), expires);
        self.expiry.insert(expires, id.to_string());

        while self.entries.len() > SOFT_CAP {
            let Some((at, victim)) = self.expiry.pop_first() else {
                break;
            };
            // Only evict if this slot is the id's latest touch.
            if self.entries.get(&victim) == Some(&at) {
                self.entries.remove(&victim);
            }
        }
    }

    /// Whether the id was seen recently. A hit refreshes the entry.
    pub fn check(&mut self, id: &str, now: Instant) -> bool {
        match self.entries.get(id) {
            Some(&expires) if expires > now => {
                self.track(id, now);
                true
            }
            Some(_) => {
                self.entries.remove(id);
                false
            }
            None => false,
        }
    }

    /// Drop every entry older than `max_age`. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for (at, id) in self.expiry.drain_due(now) {
            if self.entries.get(&id) == Some(&at) {
                self.entries.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    /// When the next sweep is worth running.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expiry.first_deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_then_check() {
        let mut dup = Dup::new(DEFAULT_MAX_AGE);
        let now = Instant::now();
        assert!(!dup.check("a", now));
        dup.track("a", now);
        assert!(dup.check("a", now));
        assert!(!dup.check("b", now));
    }

    #[test]
    fn entries_age_out() {
        let mut dup = Dup::new(Duration::from_secs(9));
        let now = Instant::now();
        dup.track("a", now);
        let later = now + Duration::from_secs(10);
        assert!(!dup.check("a", later));
    }

    #[test]
    fn sweep_keeps_refreshed_entries() {
        let mut dup = Dup::new(Duration::from_secs(9));
        let now = Instant::now();
        dup.track("old", now);
        dup.track("bumped", now);
        let mid = now + Duration::from_secs(5);
        dup.track("bumped", mid); // LRU bump

        let removed = dup.sweep(now + Duration::from_secs(9));
        assert_eq!(removed, 1);
        assert!(dup.check("bumped", now + Duration::from_secs(9)));
        assert_eq!(dup.len(), 1);
    }

    #[test]
    fn soft_cap_evicts_oldest() {
        let mut dup = Dup::new(DEFAULT_MAX_AGE);
        let base = Instant::now();
        for i in 0..(SOFT_CAP + 10) {
            dup.track(&format!("id{i}"), base + Duration::from_millis(i as u64));
        }
        assert_eq!(dup.len(), SOFT_CAP);
        // The earliest-touched ids went first.
        assert!(!dup.check("id0", base + Duration::from_secs(1)));
        assert!(dup.check(
            &format!("id{}", SOFT_CAP + 9),
            base + Duration::from_secs(1)
        ));
    }
}
