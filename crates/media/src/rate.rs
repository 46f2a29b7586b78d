//! Windowed byte and packet rates for one track, plus the cumulative
//! counters that go into RTCP sender reports.
//!
//! Two buckets: the live one accumulates, the previous one is carried
//! forward and blended in proportionally, so a mid-window reading is a
//! trailing-window estimate rather than a stale snapshot.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::rtptime::{self, JIFFIES_PER_SEC};

pub struct RateEstimator {
    /// Measurement window in jiffies.
    window: u64,
    /// Jiffies timestamp of the last bucket swap.
    time: AtomicU64,
    bytes: AtomicU32,
    packets: AtomicU32,
    /// Previous bucket, normalized to one full window.
    prev_bytes: AtomicU32,
    prev_packets: AtomicU32,
    total_bytes: AtomicU64,
    total_packets: AtomicU64,
}

impl RateEstimator {
    /// One-second window, the usual choice for RTCP statistics.
    pub fn new() -> Self {
        Self::with_window(JIFFIES_PER_SEC)
    }

    pub fn with_window(window: u64) -> Self {
        RateEstimator {
            window,
            time: AtomicU64::new(rtptime::jiffies()),
            bytes: AtomicU32::new(0),
            packets: AtomicU32::new(0),
            prev_bytes: AtomicU32::new(0),
            prev_packets: AtomicU32::new(0),
            total_bytes: AtomicU64::new(0),
            total_packets: AtomicU64::new(0),
        }
    }

    pub fn accumulate(&self, bytes: u32) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(u64::from(bytes), Ordering::Relaxed);
        self.total_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Current byte and packet rates per second.
    pub fn estimate(&self) -> (u32, u32) {
        self.estimate_at(rtptime::jiffies())
    }

    /// Testable variant taking the clock in jiffies.
    pub fn estimate_at(&self, now: u64) -> (u32, u32) {
        let window = self.window;
        let tm = self.time.load(Ordering::Acquire);
        let mut elapsed = now.saturating_sub(tm);

        if elapsed >= window
            && self
                .time
                .compare_exchange(tm, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            // roll the live bucket into the previous slot, scaled down
            // to one window's worth when the bucket ran long
            let bytes = self.bytes.swap(0, Ordering::Relaxed);
            let packets = self.packets.swap(0, Ordering::Relaxed);
            self.prev_bytes.store(
                (u64::from(bytes) * window / elapsed).min(u64::from(u32::MAX)) as u32,
                Ordering::Relaxed,
            );
            self.prev_packets.store(
                (u64::from(packets) * window / elapsed).min(u64::from(u32::MAX)) as u32,
                Ordering::Relaxed,
            );
            elapsed = 0;
        }

        let elapsed = elapsed.min(window);
        let remainder = window - elapsed;
        let bytes = u64::from(self.prev_bytes.load(Ordering::Relaxed)) * remainder / window
            + u64::from(self.bytes.load(Ordering::Relaxed));
        let packets = u64::from(self.prev_packets.load(Ordering::Relaxed)) * remainder / window
            + u64::from(self.packets.load(Ordering::Relaxed));

        (
            (bytes * JIFFIES_PER_SEC / window).min(u64::from(u32::MAX)) as u32,
            (packets * JIFFIES_PER_SEC / window).min(u64::from(u32::MAX)) as u32,
        )
    }

    /// Cumulative `(packets, bytes)`, wrapping as the 32-bit RTCP
    /// sender-report counters do.
    pub fn totals(&self) -> (u32, u32) {
        (
            self.total_packets.load(Ordering::Relaxed) as u32,
            self.total_bytes.load(Ordering::Relaxed) as u32,
        )
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Estimator whose bucket epoch is pinned for deterministic math.
    fn pinned(window: u64) -> RateEstimator {
        let e = RateEstimator::with_window(window);
        e.time.store(0, Ordering::Relaxed);
        e
    }

    #[test]
    fn one_second_window_yields_exact_rates() {
        let e = pinned(JIFFIES_PER_SEC);
        e.accumulate(42);
        e.accumulate(128);
        let (rate, packet_rate) = e.estimate_at(JIFFIES_PER_SEC);
        assert_eq!(rate, 170);
        assert_eq!(packet_rate, 2);
    }

    #[test]
    fn rate_scales_with_elapsed_time() {
        let e = pinned(JIFFIES_PER_SEC);
        e.accumulate(1000);
        // bucket rolled after two seconds: 500 bytes/s
        let (rate, packet_rate) = e.estimate_at(2 * JIFFIES_PER_SEC);
        assert_eq!(rate, 500);
        assert_eq!(packet_rate, 0); // 1 packet / 2 s rounds down
    }

    #[test]
    fn mid_window_blends_previous_bucket() {
        let e = pinned(JIFFIES_PER_SEC);
        e.accumulate(100);
        let (rate, _) = e.estimate_at(JIFFIES_PER_SEC);
        assert_eq!(rate, 100);

        // half a window later with nothing new, half the carry remains
        let (rate, _) = e.estimate_at(JIFFIES_PER_SEC + JIFFIES_PER_SEC / 2);
        assert_eq!(rate, 50);

        // fresh traffic is counted on top of the decaying carry
        e.accumulate(80);
        let (rate, _) = e.estimate_at(JIFFIES_PER_SEC + JIFFIES_PER_SEC / 2);
        assert_eq!(rate, 130);

        // by the end of the window the carry is gone
        e.bytes.store(0, Ordering::Relaxed);
        let (rate, _) = e.estimate_at(2 * JIFFIES_PER_SEC - 1);
        assert_eq!(rate, 0);
    }

    #[test]
    fn totals_accumulate_across_windows() {
        let e = pinned(JIFFIES_PER_SEC);
        e.accumulate(42);
        e.accumulate(128);
        let _ = e.estimate_at(JIFFIES_PER_SEC);
        assert_eq!(e.totals(), (2, 170));
        e.accumulate(30);
        assert_eq!(e.totals(), (3, 200));
    }
}
