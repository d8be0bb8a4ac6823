//! Connection-level ban/flood control (§4.4).

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
pub struct ShareCounters {
    pub valid: u64,
    pub invalid: u64,
}

impl ShareCounters {
    pub fn total(&self) -> u64 {
        self.valid + self.invalid
    }

    /// Evaluates the ban predicate: once `total >= check_threshold`, ban if
    /// the invalid ratio is at or above `invalid_percent` (a fraction, e.g. 0.1).
    pub fn should_ban(&self, check_threshold: u64, invalid_percent: f64) -> bool {
        let total = self.total();
        if total < check_threshold {
            return false;
        }
        (self.invalid as f64 / total as f64) >= invalid_percent
    }
}

pub struct BanConfig {
    pub check_threshold: u64,
    pub invalid_percent: f64,
    pub ban_time: Duration,
}

/// Shared across connections on one Stratum server; the supervisor
/// propagates additions from other pool workers via IPC (§5 "shared resources").
pub struct BanMap {
    entries: DashMap<IpAddr, Instant>,
    config: BanConfig,
}

impl BanMap {
    pub fn new(config: BanConfig) -> Self {
        Self { entries: DashMap::new(), config }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        match self.entries.get(ip) {
            Some(expiry) => Instant::now() < *expiry,
            None => false,
        }
    }

    pub fn ban(&self, ip: IpAddr) {
        self.entries.insert(ip, Instant::now() + self.config.ban_time);
    }

    /// Evaluate a connection's counters and ban if the threshold trips.
    /// Returns true if this call caused a ban.
    pub fn evaluate(&self, ip: IpAddr, counters: &ShareCounters) -> bool {
        if counters.should_ban(self.config.check_threshold, self.config.invalid_percent) {
            self.ban(ip);
            true
        } else {
            false
        }
    }

    /// Periodic sweep removing expired entries (§4.4 "the ban map is swept
    /// periodically").
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> BanConfig {
        BanConfig { check_threshold: 10, invalid_percent: 0.5, ban_time: Duration::from_millis(50) }
    }

    #[test]
    fn bans_after_threshold_and_ratio_exceeded() {
        let map = BanMap::new(test_config());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let counters = ShareCounters { valid: 4, invalid: 6 };
        assert!(map.evaluate(ip, &counters));
        assert!(map.is_banned(&ip));
    }

    #[test]
    fn does_not_ban_below_threshold_even_if_all_invalid() {
        let map = BanMap::new(test_config());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
        let counters = ShareCounters { valid: 0, invalid: 5 };
        assert!(!map.evaluate(ip, &counters));
        assert!(!map.is_banned(&ip));
    }

    #[test]
    fn ban_expires_after_ban_time() {
        let map = BanMap::new(test_config());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3));
        map.ban(ip);
        assert!(map.is_banned(&ip));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!map.is_banned(&ip));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let map = BanMap::new(test_config());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 4));
        map.ban(ip);
        std::thread::sleep(Duration::from_millis(60));
        map.sweep();
        assert!(map.is_empty());
    }
}
