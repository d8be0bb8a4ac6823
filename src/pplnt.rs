//! PPLNT ("Pay Per Last N Time") continuous-mining-time tracker (C7).
//!
//! Lives in the supervisor so a single logical tracker aggregates across
//! every pool-runtime task for a coin (§4.7, §9 Open Question: all maps here
//! are coin-scoped, never global). In-memory shape (DashMap of per-worker
//! timestamps, cleared wholesale on a coin event) follows the teacher's
//! `services/mining_service.rs` per-coin metrics maps.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// A worker drops out of "continuous mining" after this many idle seconds.
pub const REJOIN_THRESHOLD_SECS: i64 = 900;

#[derive(Default)]
struct CoinState {
    last_share_time_ms: DashMap<String, i64>,
    last_start_time_ms: DashMap<String, i64>,
}

/// Coin-scoped tracker. One instance lives in the supervisor; pool runtimes
/// send share-track messages to it over the outbound IPC channel described
/// in §4.5/§4.9.
#[derive(Default)]
pub struct PplntTracker {
    coins: DashMap<String, CoinState>,
}

impl PplntTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one valid-share-track message (§4.7 steps 1-5). `last_seen_secs`
    /// is the store's `lastSeen[worker]` value (epoch seconds, written by C6);
    /// `now_ms` is the current epoch-millisecond timestamp. Returns the
    /// `(field, delta_seconds)` pair to `hincrbyfloat shares:timesCurrent` with,
    /// or `None` if the worker just re-joined and should not be credited.
    pub fn track_share(
        &self,
        coin: &str,
        address: &str,
        pool_id: &str,
        last_seen_secs: Option<i64>,
        now_ms: i64,
    ) -> Option<(String, f64)> {
        let state = self.coins.entry(coin.to_string()).or_default();

        if !state.last_share_time_ms.contains_key(address) {
            state.last_share_time_ms.insert(address.to_string(), now_ms);
            state.last_start_time_ms.insert(address.to_string(), now_ms);
        }

        let in_memory_last = state.last_share_time_ms.get(address).map(|v| *v).unwrap_or(now_ms);
        let last_seen_ms = last_seen_secs.map(|s| s * 1000).unwrap_or(0);
        let unified_last = in_memory_last.max(last_seen_ms);

        let delta_secs = (now_ms - unified_last).max(0) as f64 / 1000.0;

        let result = if delta_secs < REJOIN_THRESHOLD_SECS as f64 {
            Some((format!("{address}.{pool_id}"), delta_secs))
        } else {
            state.last_start_time_ms.insert(address.to_string(), now_ms);
            None
        };

        state.last_share_time_ms.insert(address.to_string(), now_ms);
        result
    }

    /// §4.7 step 6: a valid main-chain block clears both in-memory maps for
    /// the coin — the next round starts everyone's continuous-mining clock
    /// fresh rather than carrying stale timestamps across the rename.
    pub fn clear_coin(&self, coin: &str) {
        self.coins.remove(coin);
    }

    pub fn tracked_workers(&self, coin: &str) -> usize {
        self.coins.get(coin).map(|s| s.last_share_time_ms.len()).unwrap_or(0)
    }
}

/// Monotonic-ish wall clock in epoch milliseconds, shared so callers don't
/// each reach for `SystemTime` directly.
pub fn now_ms() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let wall = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    LAST.fetch_max(wall, Ordering::Relaxed);
    LAST.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_share_initializes_without_crediting_time() {
        let tracker = PplntTracker::new();
        let (field, delta) = tracker.track_share("btc", "addr1", "btc", None, 10_000).unwrap();
        assert_eq!(field, "addr1.btc");
        assert_eq!(delta, 0.0);
    }

    #[test]
    fn continuous_mining_accrues_delta_since_unified_last() {
        let tracker = PplntTracker::new();
        tracker.track_share("btc", "addr1", "btc", None, 10_000);
        let (_, delta) = tracker.track_share("btc", "addr1", "btc", None, 15_000).unwrap();
        assert_eq!(delta, 5.0);
    }

    #[test]
    fn gap_past_threshold_resets_without_crediting() {
        let tracker = PplntTracker::new();
        tracker.track_share("btc", "addr1", "btc", None, 0);
        let far_future = (REJOIN_THRESHOLD_SECS + 10) * 1000;
        let result = tracker.track_share("btc", "addr1", "btc", None, far_future);
        assert!(result.is_none());

        // After the reset, the next share should again start from delta 0.
        let (_, delta) = tracker.track_share("btc", "addr1", "btc", None, far_future + 5_000).unwrap();
        assert_eq!(delta, 5.0);
    }

    #[test]
    fn store_last_seen_can_exceed_in_memory_last() {
        let tracker = PplntTracker::new();
        tracker.track_share("btc", "addr1", "btc", None, 0);
        // The store says this worker was seen 3s ago (in ms-normalized terms
        // that's after our in-memory timestamp), so unifiedLast should track it.
        let (_, delta) = tracker.track_share("btc", "addr1", "btc", Some(7), 10_000);
        assert_eq!(delta, 3.0);
    }

    #[test]
    fn clear_coin_drops_all_workers_for_that_coin_only() {
        let tracker = PplntTracker::new();
        tracker.track_share("btc", "addr1", "btc", None, 0);
        tracker.track_share("ltc", "addr2", "ltc", None, 0);
        tracker.clear_coin("btc");
        assert_eq!(tracker.tracked_workers("btc"), 0);
        assert_eq!(tracker.tracked_workers("ltc"), 1);
    }
}
