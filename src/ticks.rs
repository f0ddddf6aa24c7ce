// SPDX-License-Identifier: Apache-2.0

//! Tick arithmetic on a free-running, wrapping counter.
//!
//! All absolute tick values live on a circle of `mask + 1` positions. Two
//! values are ordered by the sign of their masked difference, so any pair
//! closer than half the counter range compares correctly across a wrap.

/// Invalid ticker node / "no node" marker.
pub const TICKER_NULL: u8 = 0xFF;
/// No periodic latency.
pub const TICKER_NULL_LAZY: u16 = 0;
/// Latency value that forces a node to expire on every occurrence.
pub const TICKER_LAZY_MUST_EXPIRE: u16 = 0xFFFF;
/// No slot (air-time) reservation.
pub const TICKER_NULL_SLOT: u32 = 0;
/// One-shot node.
pub const TICKER_NULL_PERIOD: u32 = 0;
/// No sub-tick remainder.
pub const TICKER_NULL_REMAINDER: u32 = 0;
/// Node priority that wins every collision.
pub const TICKER_PRIORITY_CRITICAL: i8 = -128;

/// Difference `now - old` on a full 32-bit counter.
///
/// ```
/// assert_eq!(bt_ticker::ticks::diff(1000, 500), 500);
/// assert_eq!(bt_ticker::ticks::diff(0x100, 0xFFFF_FF00), 0x200);
/// ```
#[inline]
pub const fn diff(now: u32, old: u32) -> u32 {
    now.wrapping_sub(old)
}

/// Difference `now - old` truncated to the counter width given by `mask`.
#[inline]
pub const fn diff_masked(now: u32, old: u32, mask: u32) -> u32 {
    now.wrapping_sub(old) & mask
}

/// Most significant bit of a counter mask, e.g. `1 << 23` for a 24-bit counter.
#[inline]
pub const fn msbit(mask: u32) -> u32 {
    if mask == 0 {
        return 0;
    }
    1 << (31 - mask.leading_zeros())
}

/// True if `a` lies strictly before `b` on the circular counter.
#[inline]
pub const fn is_before(a: u32, b: u32, mask: u32) -> bool {
    let d = diff_masked(b, a, mask);
    d != 0 && (d & msbit(mask)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_plain() {
        assert_eq!(diff(1000, 500), 500);
        assert_eq!(diff(500, 500), 0);
    }

    #[test]
    fn test_diff_wraps() {
        assert_eq!(diff(0x100, 0xFFFF_FF00), 0x200);
        assert_eq!(diff(100, 0xFFFF_FF00), 0x164);
        assert_eq!(diff(0, u32::MAX), 1);
    }

    #[test]
    fn test_diff_same_value_is_zero() {
        for x in [0u32, 1, 0x7FFF_FFFF, 0x8000_0000, 0xFFFF_FF00, u32::MAX] {
            assert_eq!(diff(x, x), 0);
            assert_eq!(diff_masked(x, x, 0x00FF_FFFF), 0);
        }
    }

    #[test]
    fn test_diff_masked_24bit() {
        const MASK: u32 = 0x00FF_FFFF;
        assert_eq!(diff_masked(0x10, 0x00FF_FFF0, MASK), 0x20);
        assert_eq!(diff_masked(5, 10, MASK), 0x00FF_FFFB);
    }

    #[test]
    fn test_msbit() {
        assert_eq!(msbit(u32::MAX), 0x8000_0000);
        assert_eq!(msbit(0x00FF_FFFF), 0x0080_0000);
        assert_eq!(msbit(0), 0);
    }

    #[test]
    fn test_is_before() {
        assert!(is_before(10, 20, u32::MAX));
        assert!(!is_before(20, 10, u32::MAX));
        assert!(!is_before(20, 20, u32::MAX));
        // Across the wrap
        assert!(is_before(0xFFFF_FFF0, 0x10, u32::MAX));
        assert!(is_before(0x00FF_FFF0, 0x10, 0x00FF_FFFF));
    }
}
