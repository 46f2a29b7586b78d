//! The monotonic clock shared by the estimators, in "jiffies"
//! (65536 per second, so RTP clock arithmetic stays integral), plus the
//! NTP timestamp conversions used by sender reports.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Jiffies per second. A power of two so conversions to and from the
/// 16.16 fixed-point fields of RTCP (LSR/DLSR) are shifts.
pub const JIFFIES_PER_SEC: u64 = 65536;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const UNIX_TO_NTP_EPOCH: u64 = 2_208_988_800;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current monotonic time in jiffies.
pub fn jiffies() -> u64 {
    from_duration(epoch().elapsed(), JIFFIES_PER_SEC)
}

/// Current monotonic time in units of 1/hz seconds.
pub fn now(hz: u32) -> u64 {
    from_duration(epoch().elapsed(), u64::from(hz))
}

pub fn from_duration(d: Duration, hz: u64) -> u64 {
    d.as_secs() * hz + u64::from(d.subsec_nanos()) * hz / 1_000_000_000
}

pub fn to_duration(t: u64, hz: u64) -> Duration {
    let secs = t / hz;
    let rem = t % hz;
    Duration::new(secs, (rem * 1_000_000_000 / hz) as u32)
}

/// 64-bit NTP timestamp (seconds since 1900 in the high half, binary
/// fraction in the low half) for a wall-clock instant.
pub fn ntp_time(t: SystemTime) -> u64 {
    let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs() + UNIX_TO_NTP_EPOCH;
    let fraction = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Inverse of [`ntp_time`]. Timestamps before the Unix epoch collapse
/// to the epoch.
pub fn ntp_to_time(ntp: u64) -> SystemTime {
    let seconds = (ntp >> 32).saturating_sub(UNIX_TO_NTP_EPOCH);
    let nanos = ((ntp & 0xffff_ffff) * 1_000_000_000) >> 32;
    UNIX_EPOCH + Duration::new(seconds, nanos as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversion_roundtrip() {
        let d = Duration::from_millis(1500);
        let j = from_duration(d, JIFFIES_PER_SEC);
        assert_eq!(j, 98304);
        let back = to_duration(j, JIFFIES_PER_SEC);
        assert!(back.abs_diff(d) < Duration::from_micros(20));
    }

    #[test]
    fn rtp_clock_conversion() {
        // one second of a 90 kHz video clock
        assert_eq!(from_duration(Duration::from_secs(1), 90000), 90000);
        assert_eq!(from_duration(Duration::from_millis(20), 48000), 960);
    }

    #[test]
    fn ntp_roundtrip_within_a_nanosecond_shift() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let ntp = ntp_time(t);
        let back = ntp_to_time(ntp);
        let diff = back
            .duration_since(t)
            .unwrap_or_else(|e| e.duration());
        assert!(diff < Duration::from_nanos(2));
    }

    #[test]
    fn ntp_epoch_offset() {
        let ntp = ntp_time(UNIX_EPOCH);
        assert_eq!(ntp >> 32, UNIX_TO_NTP_EPOCH);
        assert_eq!(ntp & 0xffff_ffff, 0);
    }

    #[test]
    fn jiffies_is_monotonic() {
        let a = jiffies();
        let b = jiffies();
        assert!(b >= a);
    }
}
