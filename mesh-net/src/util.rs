//! Timer plumbing for the protocol driver.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A [`BTreeMap`] keyed by [`Instant`], collecting items due at each
/// deadline.
#[derive(Debug)]
pub struct TimerMap<T> {
    inner: BTreeMap<Instant, Vec<T>>,
}

impl<T> Default for TimerMap<T> {
    fn default() -> Self {
        TimerMap {
            inner: BTreeMap::new(),
        }
    }
}

impl<T> TimerMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn insert(&mut self, at: Instant, item: T) {
        self.inner.entry(at).or_default().push(item);
    }

    /// The earliest deadline with a pending item.
    pub fn first_deadline(&self) -> Option<Instant> {
        self.inner.keys().next().copied()
    }

    /// Remove and return everything due at or before `now`.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(Instant, T)> {
        let later = self.inner.split_off(&(now + Duration::from_nanos(1)));
        let due = std::mem::replace(&mut self.inner, later);
        due.into_iter()
            .flat_map(|(at, items)| items.into_iter().map(move |item| (at, item)))
            .collect()
    }

    /// Remove and return the single earliest item.
    pub fn pop_first(&mut self) -> Option<(Instant, T)> {
        let at = self.first_deadline()?;
        let items = self.inner.get_mut(&at)?;
        let item = items.remove(0);
        if items.is_empty() {
            self.inner.remove(&at);
        }
        Some((at, item))
    }
}

/// A [`TimerMap`] awaitable from a `select!` loop.
///
/// [`Timers::next`] sleeps until the earliest deadline and drains everything
/// due; with no pending timers it never resolves. The returned future is
/// recreated on every `select!` iteration, so inserts made by other arms take
/// effect on the next loop turn.
#[derive(Debug, Default)]
pub struct Timers<T> {
    map: TimerMap<T>,
}

impl<T> Timers<T> {
    pub fn new() -> Self {
        Timers {
            map: TimerMap::new(),
        }
    }

    pub fn insert(&mut self, at: Instant, item: T) {
        self.map.insert(at, item);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Wait for the next deadline and return the due items.
    pub async fn next(&mut self) -> Vec<T> {
        match self.map.first_deadline() {
            Some(at) => {
                tokio::time::sleep_until(at.into()).await;
                self.map
                    .drain_due(Instant::now())
                    .into_iter()
                    .map(|(_, item)| item)
                    .collect()
            }
            None => futures::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_due_splits_at_now() {
        let mut map = TimerMap::new();
        let base = Instant::now();
        map.insert(base, "a");
        map.insert(base + Duration::from_millis(5), "b");
        map.insert(base + Duration::from_secs(60), "c");

        let due: Vec<&str> = map
            .drain_due(base + Duration::from_millis(5))
            .into_iter()
            .map(|(_, x)| x)
            .collect();
        assert_eq!(due, vec!["a", "b"]);
        assert_eq!(map.first_deadline(), Some(base + Duration::from_secs(60)));
    }

    #[test]
    fn pop_first_in_deadline_order() {
        let mut map = TimerMap::new();
        let base = Instant::now();
        map.insert(base + Duration::from_secs(2), "late");
        map.insert(base, "early");
        assert_eq!(map.pop_first().map(|(_, x)| x), Some("early"));
        assert_eq!(map.pop_first().map(|(_, x)| x), Some("late"));
        assert!(map.pop_first().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_at_deadline() {
        let mut timers = Timers::new();
        timers.insert(Instant::now() + Duration::from_millis(50), 1u32);
        timers.insert(Instant::now() + Duration::from_millis(50), 2u32);
        let fired = timers.next().await;
        assert_eq!(fired, vec![1, 2]);
        assert!(timers.is_empty());
    }
}
