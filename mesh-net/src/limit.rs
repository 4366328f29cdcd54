//! Per-connection rate limiting: a sliding window with escalation.
//!
//! Each client gets a 60 s sliding window capped at 1500 requests. A breach
//! asks the caller to delay the client until the oldest request leaves the
//! window; ten breaches escalate to a disconnect. Idle clients are forgotten
//! by a periodic sweep, which the owning loop disables under test.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::transport::ConnId;

/// Sliding window length.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Requests allowed per window.
pub const MAX_REQUESTS: usize = 1500;

/// Throttles before a client is disconnected.
pub const MAX_THROTTLES: u32 = 10;

/// Idle windows before a client's counters reset.
pub const IDLE_WINDOWS: u32 = 10;

/// Interval between cleanup sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// What to do with the client's current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Hold the request until the window has room again.
    Throttle(Duration),
    /// Sustained breach; drop the connection.
    Disconnect,
}

#[derive(Debug, Default)]
struct ClientWindow {
    hits: VecDeque<Instant>,
    throttles: u32,
    last_seen: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    clients: HashMap<ConnId, ClientWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one request from `conn` at `now`.
    pub fn check(&mut self, conn: ConnId, now: Instant) -> Decision {
        let client = self.clients.entry(conn).or_default();
        client.last_seen = Some(now);

        while let Some(&oldest) = client.hits.front() {
            if oldest + WINDOW <= now {
                client.hits.pop_front();
            } else {
                break;
            }
        }

        if client.hits.len() < MAX_REQUESTS {
            client.hits.push_back(now);
            return Decision::Allow;
        }

        client.throttles += 1;
        if client.throttles >= MAX_THROTTLES {
            return Decision::Disconnect;
        }
        let oldest = client.hits.front().copied().unwrap_or(now);
        Decision::Throttle((oldest + WINDOW).saturating_duration_since(now))
    }

    /// Forget a disconnected client.
    pub fn forget(&mut self, conn: ConnId) {
        self.clients.remove(&conn);
    }

    /// Drop counters for clients idle longer than [`IDLE_WINDOWS`] windows.
    pub fn sweep(&mut self, now: Instant) {
        let idle_for = WINDOW * IDLE_WINDOWS;
        self.clients.retain(|_, client| {
            client
                .last_seen
                .map(|seen| now.saturating_duration_since(seen) < idle_for)
                .unwrap_or(false)
        });
    }

    pub fn tracked(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_cap() {
        let mut limiter = RateLimiter::new();
        let conn = ConnId::fresh();
        let now = Instant::now();
        for _ in 0..MAX_REQUESTS {
            assert_eq!(limiter.check(conn, now), Decision::Allow);
        }
        assert!(matches!(limiter.check(conn, now), Decision::Throttle(_)));
    }

    #[test]
    fn throttle_delay_is_window_remainder() {
        let mut limiter = RateLimiter::new();
        let conn = ConnId::fresh();
        let start = Instant::now();
        for _ in 0..MAX_REQUESTS {
            limiter.check(conn, start);
        }
        let later = start + Duration::from_secs(20);
        match limiter.check(conn, later) {
            Decision::Throttle(delay) => assert_eq!(delay, Duration::from_secs(40)),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn window_slides() {
        let mut limiter = RateLimiter::new();
        let conn = ConnId::fresh();
        let start = Instant::now();
        for _ in 0..MAX_REQUESTS {
            limiter.check(conn, start);
        }
        // After the window passes, the client is clean again.
        let later = start + WINDOW;
        assert_eq!(limiter.check(conn, later), Decision::Allow);
    }

    #[test]
    fn sustained_breach_disconnects() {
        let mut limiter = RateLimiter::new();
        let conn = ConnId::fresh();
        let now = Instant::now();
        for _ in 0..MAX_REQUESTS {
            limiter.check(conn, now);
        }
        let mut last = Decision::Allow;
        for _ in 0..MAX_THROTTLES {
            last = limiter.check(conn, now);
        }
        assert_eq!(last, Decision::Disconnect);
    }

    #[test]
    fn sweep_forgets_idle_clients() {
        let mut limiter = RateLimiter::new();
        let conn = ConnId::fresh();
        let busy = ConnId::fresh();
        let start = Instant::now();
        limiter.check(conn, start);
        limiter.check(busy, start);

        let later = start + WINDOW * IDLE_WINDOWS;
        limiter.check(busy, later);
        limiter.sweep(later);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn independent_clients() {
        let mut limiter = RateLimiter::new();
        let a = ConnId::fresh();
        let b = ConnId::fresh();
        let now = Instant::now();
        for _ in 0..MAX_REQUESTS {
            limiter.check(a, now);
        }
        assert_eq!(limiter.check(b, now), Decision::Allow);
    }
}
