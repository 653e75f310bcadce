//! Liveness detection for cluster members.
//!
//! Default: 3-second heartbeat interval, 3× timeout (9 seconds).
//! If a rank misses 3 consecutive heartbeats, it is declared lost.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tandem_types::config::HeartbeatConfig;

/// Tracks the last heartbeat response from each registered rank.
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    /// `rank → last heartbeat time`
    last_seen: HashMap<usize, Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout_factor: u32) -> Self {
        Self {
            interval,
            timeout: interval * timeout_factor,
            last_seen: HashMap::new(),
        }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(config.interval, config.timeout_factor)
    }

    /// Start tracking a rank. Registration counts as a heartbeat.
    pub fn register(&mut self, rank: usize) {
        self.last_seen.insert(rank, Instant::now());
    }

    /// Record a heartbeat for a tracked rank. Resets its timeout clock.
    /// Responses from ranks that are not tracked are ignored.
    pub fn record_heartbeat(&mut self, rank: usize) {
        if let Some(last) = self.last_seen.get_mut(&rank) {
            *last = Instant::now();
        }
    }

    /// Ranks that have exceeded the timeout threshold, in ascending order.
    pub fn check_timeouts(&self) -> Vec<usize> {
        let now = Instant::now();
        let mut timed_out: Vec<usize> = self
            .last_seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.timeout)
            .map(|(rank, _)| *rank)
            .collect();
        timed_out.sort_unstable();
        timed_out
    }

    pub fn is_alive(&self, rank: usize) -> bool {
        match self.last_seen.get(&rank) {
            Some(last) => Instant::now().duration_since(*last) <= self.timeout,
            None => false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop tracking a rank that left gracefully.
    pub fn remove(&mut self, rank: usize) {
        self.last_seen.remove(&rank);
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_alive() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(3), 3);
        hb.register(1);
        hb.register(2);

        assert!(hb.is_alive(1));
        assert!(hb.is_alive(2));
        assert!(!hb.is_alive(3)); // never registered
    }

    #[test]
    fn no_timeouts_initially() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(3), 3);
        hb.register(1);
        assert!(hb.check_timeouts().is_empty());
    }

    #[test]
    fn silent_rank_times_out() {
        let mut hb = HeartbeatMonitor::new(Duration::from_millis(5), 2);
        hb.register(1);
        hb.register(2);
        std::thread::sleep(Duration::from_millis(20));
        hb.record_heartbeat(2);
        assert_eq!(hb.check_timeouts(), vec![1]);
        assert!(hb.is_alive(2));
    }

    #[test]
    fn unknown_rank_heartbeat_ignored() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(3), 3);
        hb.record_heartbeat(7);
        assert!(!hb.is_alive(7));
    }

    #[test]
    fn remove_stops_tracking() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(3), 3);
        hb.register(1);
        hb.remove(1);
        assert!(!hb.is_alive(1));
        hb.register(2);
        hb.clear();
        assert!(!hb.is_alive(2));
    }

    #[test]
    fn durations() {
        let hb = HeartbeatMonitor::from_config(&HeartbeatConfig::default());
        assert_eq!(hb.interval(), Duration::from_secs(3));
        assert_eq!(hb.timeout(), Duration::from_secs(9));
    }
}
