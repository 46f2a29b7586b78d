//! RFC 3550 interarrival jitter, in units of the track's RTP clock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::rtptime;

pub struct JitterEstimator {
    hz: u32,
    valid: AtomicBool,
    timestamp: AtomicU32,
    arrival: AtomicU32,
    jitter: AtomicU32,
}

impl JitterEstimator {
    pub fn new(hz: u32) -> Self {
        JitterEstimator {
            hz,
            valid: AtomicBool::new(false),
            timestamp: AtomicU32::new(0),
            arrival: AtomicU32::new(0),
            jitter: AtomicU32::new(0),
        }
    }

    pub fn hz(&self) -> u32 {
        self.hz
    }

    /// Feed one packet's RTP timestamp, using the monotonic clock for
    /// the arrival time.
    pub fn accumulate(&self, timestamp: u32) {
        self.accumulate_at(timestamp, rtptime::now(self.hz) as u32);
    }

    /// Testable variant: `arrival` is in units of 1/hz seconds.
    /// Only ever called from the track's reader; concurrent `jitter`
    /// reads are safe.
    pub fn accumulate_at(&self, timestamp: u32, arrival: u32) {
        if !self.valid.load(Ordering::Acquire) {
            self.timestamp.store(timestamp, Ordering::Relaxed);
            self.arrival.store(arrival, Ordering::Relaxed);
            self.valid.store(true, Ordering::Release);
            return;
        }

        let prev_timestamp = self.timestamp.swap(timestamp, Ordering::Relaxed);
        let prev_arrival = self.arrival.swap(arrival, Ordering::Relaxed);

        let d = arrival
            .wrapping_sub(prev_arrival)
            .wrapping_sub(timestamp.wrapping_sub(prev_timestamp)) as i32;
        let d = d.unsigned_abs();

        let jitter = self.jitter.load(Ordering::Relaxed);
        let jitter = (jitter.wrapping_mul(15).wrapping_add(d)) / 16;
        self.jitter.store(jitter, Ordering::Relaxed);
    }

    /// Current estimate in 1/hz units.
    pub fn jitter(&self) -> u32 {
        self.jitter.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.valid.store(false, Ordering::Release);
        self.jitter.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_stream_converges_to_zero() {
        let e = JitterEstimator::new(90000);
        // perfectly paced 20 ms frames: arrival tracks the timestamp
        for i in 0..200u32 {
            e.accumulate_at(i * 1800, 500 + i * 1800);
        }
        assert_eq!(e.jitter(), 0);
    }

    #[test]
    fn spike_contributes_one_sixteenth_then_decays() {
        let e = JitterEstimator::new(48000);
        for i in 0..10u32 {
            e.accumulate_at(i * 960, i * 960);
        }
        assert_eq!(e.jitter(), 0);

        // one packet arrives 1600 units late
        e.accumulate_at(10 * 960, 10 * 960 + 1600);
        assert_eq!(e.jitter(), 1600 / 16);

        // the next packet is on time again (its D is the spike going away,
        // so it contributes 1600/16 once more), then the decay is 15/16
        e.accumulate_at(11 * 960, 11 * 960);
        let mut expected = (100 * 15 + 1600) / 16;
        assert_eq!(e.jitter(), expected);
        for i in 12..20u32 {
            e.accumulate_at(i * 960, i * 960);
            expected = expected * 15 / 16;
            assert_eq!(e.jitter(), expected);
        }
    }

    #[test]
    fn timestamp_wraparound_is_harmless() {
        let e = JitterEstimator::new(90000);
        e.accumulate_at(u32::MAX - 900, 0);
        e.accumulate_at(900, 1800);
        // (1800 - 0) - (900 - (MAX-900)) = 1800 - 1801 = -1
        assert_eq!(e.jitter(), (0 * 15 + 1) / 16);
        assert_eq!(e.jitter(), 0);
    }

    #[test]
    fn reset_clears_state() {
        let e = JitterEstimator::new(48000);
        e.accumulate_at(0, 0);
        e.accumulate_at(960, 2000);
        assert!(e.jitter() > 0);
        e.reset();
        assert_eq!(e.jitter(), 0);
        e.accumulate_at(0, 5000);
        assert_eq!(e.jitter(), 0);
    }
}
