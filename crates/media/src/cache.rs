//! A fixed-capacity ring of recent RTP packets keyed by sequence
//! number. Backs NACK-based retransmission and the reception
//! statistics that go into RTCP receiver reports.

use parking_lot::Mutex;

use crate::seqno_distant;
use crate::seqwindow::SeqWindow;

/// Largest RTP packet the cache will hold.
pub const BUF_SIZE: usize = 1504;
pub const MIN_CAPACITY: usize = 32;
pub const MAX_CAPACITY: usize = 256;

struct Entry {
    seqno: u16,
    /// Zero marks an empty slot.
    length: u16,
    buf: [u8; BUF_SIZE],
}

impl Entry {
    fn empty() -> Self {
        Entry {
            seqno: 0,
            length: 0,
            buf: [0; BUF_SIZE],
        }
    }
}

/// RFC 3550 reception statistics, as of the last `get_stats` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Packets expected in the current interval.
    pub expected: u32,
    /// Packets lost in the current interval.
    pub lost: u32,
    /// Cumulative packets lost.
    pub total_lost: u32,
    /// Extended (cycle-counted) highest sequence number seen.
    pub extended_seqno: u32,
}

struct Inner {
    entries: Vec<Entry>,
    tail: usize,

    last: u16,
    cycle: u16,
    last_valid: bool,
    expected: u32,
    lost: u32,
    total_lost: u32,

    window: SeqWindow,
}

/// Thread-safe packet cache; the hot path stores under one short
/// critical section, retransmission reads under another.
pub struct PacketCache {
    inner: Mutex<Inner>,
}

impl PacketCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        PacketCache {
            inner: Mutex::new(Inner {
                entries: (0..capacity).map(|_| Entry::empty()).collect(),
                tail: 0,
                last: 0,
                cycle: 0,
                last_valid: false,
                expected: 0,
                lost: 0,
                total_lost: 0,
                window: SeqWindow::new(),
            }),
        }
    }

    /// Store a packet. Returns the lowest sequence number the NACK
    /// window still tracks, and the slot index the packet went into.
    pub fn store(&self, seqno: u16, data: &[u8]) -> (u16, u16) {
        let mut inner = self.inner.lock();

        if !inner.last_valid || seqno_distant(seqno, inner.last) {
            if inner.last_valid {
                // stream restart
                inner.expected = 0;
                inner.lost = 0;
                inner.cycle = 0;
                inner.window.reset();
            }
            inner.last = seqno;
            inner.last_valid = true;
            inner.expected = inner.expected.wrapping_add(1);
        } else {
            let delta = seqno.wrapping_sub(inner.last);
            if delta & 0x8000 == 0 && delta != 0 {
                inner.expected = inner.expected.wrapping_add(u32::from(delta));
                inner.lost = inner.lost.wrapping_add(u32::from(delta) - 1);
                if seqno < inner.last {
                    inner.cycle = inner.cycle.wrapping_add(1);
                }
                inner.last = seqno;
            } else if delta != 0 {
                // reordered or retransmitted packet recovers a loss
                if inner.lost > 0 {
                    inner.lost -= 1;
                }
            }
        }
        inner.window.set(seqno);

        let index = inner.tail;
        let len = data.len().min(BUF_SIZE);
        let entry = &mut inner.entries[index];
        entry.seqno = seqno;
        entry.length = len as u16;
        entry.buf[..len].copy_from_slice(&data[..len]);
        inner.tail = (index + 1) % inner.entries.len();

        (inner.window.first(), index as u16)
    }

    /// Copy the packet with the given sequence number into `buf`.
    /// Returns the packet length, or 0 when not cached.
    pub fn get(&self, seqno: u16, buf: &mut [u8]) -> usize {
        let inner = self.inner.lock();
        for entry in &inner.entries {
            if entry.length == 0 || entry.seqno != seqno {
                continue;
            }
            return copy_entry(entry, buf);
        }
        0
    }

    /// Fast path for callers that remember the slot returned by
    /// `store`. Falls back to 0 when the slot has been overwritten.
    pub fn get_at(&self, seqno: u16, index: u16, buf: &mut [u8]) -> usize {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.get(usize::from(index)) else {
            return 0;
        };
        if entry.length == 0 || entry.seqno != seqno {
            return 0;
        }
        copy_entry(entry, buf)
    }

    /// Drain the next window of missing packets below `next` as one
    /// NACK pair (first missing seqno, 16-bit following bitmap).
    pub fn bitmap_get(&self, next: u16) -> Option<(u16, u16)> {
        self.inner.lock().window.get17(next)
    }

    /// Reception statistics; with `reset`, starts a new interval
    /// (as required between consecutive receiver reports).
    pub fn get_stats(&self, reset: bool) -> CacheStats {
        let mut inner = self.inner.lock();
        let stats = CacheStats {
            expected: inner.expected,
            lost: inner.lost,
            total_lost: inner.total_lost.wrapping_add(inner.lost),
            extended_seqno: u32::from(inner.cycle) << 16 | u32::from(inner.last),
        };
        if reset {
            inner.total_lost = inner.total_lost.wrapping_add(inner.lost);
            inner.expected = 0;
            inner.lost = 0;
        }
        stats
    }

    /// Record that `n` retransmissions were requested, so packets that
    /// arrive in response are not counted as unexpected.
    pub fn expect(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.expected = inner.expected.wrapping_add(n);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Resize to `capacity` slots, but only when the current size is
    /// clearly off: growth whenever the target exceeds the current
    /// size, shrinking only below half of it. The target is clamped to
    /// `32..=256`. Returns whether a resize happened.
    pub fn resize_cond(&self, capacity: usize) -> bool {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        let mut inner = self.inner.lock();
        let current = inner.entries.len();
        if capacity > current || capacity * 2 <= current {
            inner.resize(capacity);
            true
        } else {
            false
        }
    }
}

impl Inner {
    /// Rebuild the ring at the new capacity, keeping the most recent
    /// packets in arrival order.
    fn resize(&mut self, capacity: usize) {
        let old_len = self.entries.len();
        let mut kept: Vec<Entry> = Vec::with_capacity(capacity);
        // walk the ring oldest-first starting at tail
        for off in 0..old_len {
            let i = (self.tail + off) % old_len;
            if self.entries[i].length == 0 {
                continue;
            }
            kept.push(std::mem::replace(&mut self.entries[i], Entry::empty()));
        }
        if kept.len() > capacity {
            kept.drain(..kept.len() - capacity);
        }
        let used = kept.len();
        kept.resize_with(capacity, Entry::empty);
        self.entries = kept;
        self.tail = used % capacity;
    }
}

fn copy_entry(entry: &Entry, buf: &mut [u8]) -> usize {
    let len = usize::from(entry.length).min(buf.len());
    buf[..len].copy_from_slice(&entry.buf[..len]);
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(seqno: u16) -> Vec<u8> {
        let mut p = vec![0u8; 64];
        p[0] = (seqno >> 8) as u8;
        p[1] = (seqno & 0xff) as u8;
        p[2] = 0xbe;
        p
    }

    #[test]
    fn store_then_get_roundtrip_from_bitmap() {
        let cache = PacketCache::new(128);
        // store packets selected by a 64-bit pattern
        let pattern: u64 = 0xdead_beef_cafe_f00d;
        for i in 0..64u16 {
            if pattern & (1 << i) != 0 {
                cache.store(1000 + i, &payload(1000 + i));
            }
        }
        let mut buf = [0u8; BUF_SIZE];
        for i in 0..64u16 {
            let n = cache.get(1000 + i, &mut buf);
            if pattern & (1 << i) != 0 {
                assert_eq!(n, 64, "seqno {} should be cached", 1000 + i);
                assert_eq!(&buf[..3], &payload(1000 + i)[..3]);
            } else {
                assert_eq!(n, 0, "seqno {} should be absent", 1000 + i);
            }
        }
    }

    #[test]
    fn get_at_fast_path_and_eviction() {
        let cache = PacketCache::new(32);
        let (_, index) = cache.store(7, &payload(7));
        let mut buf = [0u8; BUF_SIZE];
        assert_eq!(cache.get_at(7, index, &mut buf), 64);
        // overwrite the whole ring; the remembered slot must miss
        for i in 0..32u16 {
            cache.store(100 + i, &payload(100 + i));
        }
        assert_eq!(cache.get_at(7, index, &mut buf), 0);
        assert_eq!(cache.get(7, &mut buf), 0);
    }

    #[test]
    fn bitmap_enumerates_exactly_the_missing() {
        let cache = PacketCache::new(64);
        let present = [0u16, 1, 2, 5, 6, 8, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        for &s in &present {
            cache.store(42 + s, &payload(42 + s));
        }
        let mut missing = Vec::new();
        while let Some((first, bitmap)) = cache.bitmap_get(42 + 21) {
            missing.push(first);
            for i in 0..16u16 {
                if bitmap & (1 << i) != 0 {
                    missing.push(first + i + 1);
                }
            }
        }
        let expected: Vec<u16> = (0..21u16)
            .filter(|s| !present.contains(s))
            .map(|s| 42 + s)
            .collect();
        assert_eq!(missing, expected);
    }

    #[test]
    fn stats_follow_rfc3550_counters() {
        let cache = PacketCache::new(32);
        cache.store(10, &payload(10));
        cache.store(11, &payload(11));
        cache.store(14, &payload(14)); // 12, 13 lost
        let stats = cache.get_stats(false);
        assert_eq!(stats.expected, 5);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.extended_seqno, 14);

        // a late packet recovers one loss
        cache.store(12, &payload(12));
        let stats = cache.get_stats(true);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.total_lost, 1);

        // interval counters restart after reset
        cache.store(15, &payload(15));
        let stats = cache.get_stats(false);
        assert_eq!(stats.expected, 1);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.total_lost, 1);
    }

    #[test]
    fn expect_credits_outstanding_retransmissions() {
        let cache = PacketCache::new(32);
        cache.store(1, &payload(1));
        cache.store(5, &payload(5));
        cache.expect(3);
        let stats = cache.get_stats(false);
        assert_eq!(stats.expected, 5 + 3);
    }

    #[test]
    fn sequence_cycle_extends_seqno() {
        let cache = PacketCache::new(32);
        cache.store(0xfffe, &payload(0xfffe));
        cache.store(0xffff, &payload(0xffff));
        cache.store(0, &payload(0));
        let stats = cache.get_stats(false);
        assert_eq!(stats.extended_seqno, 1 << 16);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn wild_jump_resets_the_cache() {
        let cache = PacketCache::new(32);
        cache.store(100, &payload(100));
        cache.store(101, &payload(101));
        cache.store(40000, &payload(40000));
        let stats = cache.get_stats(false);
        assert_eq!(stats.expected, 1);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.extended_seqno, 40000);
    }

    #[test]
    fn resize_cond_hysteresis() {
        let cache = PacketCache::new(32);
        assert!(!cache.resize_cond(32));
        assert!(!cache.resize_cond(20)); // clamped to 32, no change
        assert!(cache.resize_cond(64));
        assert_eq!(cache.capacity(), 64);
        // mild shrink request is ignored, halving is honored
        assert!(!cache.resize_cond(48));
        assert!(cache.resize_cond(32));
        assert_eq!(cache.capacity(), 32);
        // bounds
        assert!(cache.resize_cond(1024));
        assert_eq!(cache.capacity(), 256);
    }

    #[test]
    fn resize_preserves_recent_packets() {
        let cache = PacketCache::new(32);
        for i in 0..32u16 {
            cache.store(i, &payload(i));
        }
        cache.resize_cond(64);
        let mut buf = [0u8; BUF_SIZE];
        for i in 0..32u16 {
            assert_eq!(cache.get(i, &mut buf), 64, "seqno {i} lost in resize");
        }
        // and the ring keeps accepting packets after the move
        for i in 32..96u16 {
            cache.store(i, &payload(i));
        }
        assert_eq!(cache.get(95, &mut buf), 64);
        assert_eq!(cache.get(31, &mut buf), 0);
    }
}
