use std::time::{Duration, Instant};

/// Client-side heartbeat bookkeeping for the active tier. Any inbound event
/// counts as traffic; silence longer than the liveness timeout marks the
/// tier dead. A zero interval disables the matching check.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    ping_interval: Duration,
    liveness_timeout: Duration,
    last_traffic: Instant,
    last_ping: Instant,
}

impl HealthMonitor {
    pub fn new(ping_interval: Duration, liveness_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            liveness_timeout,
            last_traffic: now,
            last_ping: now,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_traffic = now;
        self.last_ping = now;
    }

    pub fn observe(&mut self, now: Instant) {
        self.last_traffic = now;
    }

    pub fn ping_due(&self, now: Instant) -> bool {
        !self.ping_interval.is_zero() && now.duration_since(self.last_ping) >= self.ping_interval
    }

    pub fn mark_ping(&mut self, now: Instant) {
        self.last_ping = now;
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.duration_since(self.last_traffic)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        !self.liveness_timeout.is_zero() && self.silence(now) >= self.liveness_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_keeps_tier_alive() {
        let start = Instant::now();
        let mut monitor = HealthMonitor::new(Duration::from_secs(5), Duration::from_secs(15), start);
        assert!(!monitor.is_stale(start + Duration::from_secs(14)));
        assert!(monitor.is_stale(start + Duration::from_secs(15)));

        monitor.observe(start + Duration::from_secs(10));
        assert!(!monitor.is_stale(start + Duration::from_secs(20)));
        assert_eq!(
            monitor.silence(start + Duration::from_secs(20)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn ping_is_due_once_per_interval() {
        let start = Instant::now();
        let mut monitor = HealthMonitor::new(Duration::from_secs(5), Duration::from_secs(15), start);
        assert!(!monitor.ping_due(start + Duration::from_secs(4)));
        assert!(monitor.ping_due(start + Duration::from_secs(5)));
        monitor.mark_ping(start + Duration::from_secs(5));
        assert!(!monitor.ping_due(start + Duration::from_secs(9)));
    }

    #[test]
    fn zero_intervals_disable_checks() {
        let start = Instant::now();
        let monitor = HealthMonitor::new(Duration::ZERO, Duration::ZERO, start);
        let later = start + Duration::from_secs(3600);
        assert!(!monitor.ping_due(later));
        assert!(!monitor.is_stale(later));
    }

    #[test]
    fn reset_restarts_both_clocks() {
        let start = Instant::now();
        let mut monitor = HealthMonitor::new(Duration::from_secs(5), Duration::from_secs(15), start);
        let later = start + Duration::from_secs(30);
        assert!(monitor.is_stale(later));
        monitor.reset(later);
        assert!(!monitor.is_stale(later));
        assert!(!monitor.ping_due(later));
    }
}
