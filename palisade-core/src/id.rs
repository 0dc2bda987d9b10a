//! Process-wide monotonic request id generation.
//!
//! Ids are 64-bit values laid out as
//!
//! ```text
//! | prefix    | suffix              |
//! | 1 byte    | 5 bytes   | 2 bytes |
//! | member id | timestamp | count   |
//! ```
//!
//! The prefix is the low byte of the local member id; the suffix seeds its
//! high 5 bytes from the wall clock in milliseconds and increments on every
//! call. Count overflow ripples into the timestamp field, which is
//! intentional: it extends the uniqueness window to 2^56 increments, and a
//! restart lands on a fresh millisecond long before a process can burn
//! through 65536 ids per millisecond.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

const TS_BITS: u32 = 5 * 8;
const CNT_BITS: u32 = 2 * 8;
const SUFFIX_BITS: u32 = TS_BITS + CNT_BITS;

pub struct Generator {
    prefix: u64,
    suffix: Mutex<u64>,
}

impl Generator {
    pub fn new(member_byte: u8, now: DateTime<Utc>) -> Self {
        let unix_millis = now.timestamp_millis() as u64;
        Generator {
            prefix: u64::from(member_byte) << SUFFIX_BITS,
            suffix: Mutex::new(low_bits(unix_millis, TS_BITS) << CNT_BITS),
        }
    }

    /// Generate the next unique id.
    pub fn next(&self) -> u64 {
        let mut suffix = self.suffix.lock().unwrap_or_else(|e| e.into_inner());
        *suffix += 1;
        self.prefix | low_bits(*suffix, SUFFIX_BITS)
    }
}

fn low_bits(x: u64, n: u32) -> u64 {
    x & (u64::MAX >> (64 - n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let gen = Generator::new(0x12, Utc::now());
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(gen.next()));
        }
    }

    #[test]
    fn test_prefix_is_member_byte() {
        let gen = Generator::new(0xab, Utc::now());
        for _ in 0..100 {
            assert_eq!(gen.next() >> 56, 0xab);
        }
    }

    #[test]
    fn test_counter_increments_within_same_millisecond() {
        let now = Utc::now();
        let gen = Generator::new(1, now);
        let a = gen.next();
        let b = gen.next();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_restart_after_one_millisecond_is_unique() {
        let now = Utc::now();
        let gen = Generator::new(1, now);
        let before: Vec<u64> = (0..10).map(|_| gen.next()).collect();

        let later = now + chrono::Duration::milliseconds(1);
        let restarted = Generator::new(1, later);
        let after = restarted.next();
        assert!(!before.contains(&after));
    }
}
