// SPDX-License-Identifier: Apache-2.0

use crate::ticks::{diff_masked, msbit, TICKER_LAZY_MUST_EXPIRE, TICKER_NULL};

/// Timeout callback, invoked from the worker for every fired occurrence.
pub type TimeoutFn<'a> = &'a (dyn Fn(&Expiry) + Sync);

/// Snapshot of a node's most recent expiry, shared with linked nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireInfo {
    pub ticks_at_expire: u32,
    pub remainder: u32,
    pub lazy: u16,
}

/// What a timeout callback learns about the occurrence it is called for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub ticker_id: u8,
    /// Absolute tick of the occurrence, negative drift already applied.
    pub ticks_at_expire: u32,
    /// Net drift (plus minus minus, wrapping) applied by updates since the
    /// previous occurrence.
    pub ticks_drift: u32,
    /// Sub-tick remainder of this occurrence, two's complement.
    pub remainder: u32,
    /// Occurrences skipped since the last one that fired, or
    /// [`TICKER_LAZY_MUST_EXPIRE`] for a must-expire node that lost its
    /// slot this time.
    pub lazy: u16,
    pub force: u8,
    /// Most recent expiry of the node linked with `expire_info_id`.
    pub expire_info: Option<ExpireInfo>,
}

impl Expiry {
    /// True for the shallow callback a must-expire node gets when it lost a
    /// slot collision.
    pub fn is_must_expire_skip(&self) -> bool {
        self.lazy == TICKER_LAZY_MUST_EXPIRE
    }
}

/// Scheduling state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Idle,
    /// Linked into the active list, waiting for its expiry.
    Scheduled,
    /// Fired by the worker; the job has not re-armed or released it yet.
    Expired,
    /// Due but skipped by the worker, its latency already counted. Later
    /// worker passes leave it alone until the job re-arms it.
    Skipped,
    /// Unlinked by the job, waiting to be inserted again.
    Requeued,
}

/// Progress of a node that lost a collision but may move within its
/// slot window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reschedule {
    None,
    /// Marked by the worker.
    Pending,
    /// Pulled out of the list by the job, `anchor` is the skipped expiry.
    Parked { anchor: u32 },
    /// Inserted into a free gap `displacement` ticks after its anchor.
    Placed { displacement: u32 },
}

pub(crate) struct Node<'a> {
    pub next: u8,
    pub state: NodeState,
    pub force: u8,
    pub ticks_periodic: u32,
    /// Relative to the previous node in the active list.
    pub ticks_to_expire: u32,
    /// Negative drift not yet absorbed into `ticks_to_expire`.
    pub ticks_to_expire_minus: u32,
    pub ticks_slot: u32,
    pub ticks_slot_window: u32,
    pub lazy_periodic: u16,
    pub lazy_current: u16,
    pub remainder_periodic: u32,
    pub remainder_current: u32,
    pub must_expire: bool,
    pub priority: i8,
    pub ticks_drift: u32,
    pub timeout: Option<TimeoutFn<'a>>,
    pub expire_info_id: u8,
    pub last_expiry: Option<ExpireInfo>,
    pub stop_at: Option<u32>,
    pub reschedule: Reschedule,
}

impl<'a> Node<'a> {
    pub const fn new() -> Self {
        Node {
            next: TICKER_NULL,
            state: NodeState::Idle,
            force: 0,
            ticks_periodic: 0,
            ticks_to_expire: 0,
            ticks_to_expire_minus: 0,
            ticks_slot: 0,
            ticks_slot_window: 0,
            lazy_periodic: 0,
            lazy_current: 0,
            remainder_periodic: 0,
            remainder_current: 0,
            must_expire: false,
            priority: 0,
            ticks_drift: 0,
            timeout: None,
            expire_info_id: TICKER_NULL,
            last_expiry: None,
            stop_at: None,
            reschedule: Reschedule::None,
        }
    }

    /// Leave the scheduler. Configuration stays until the next start.
    pub fn release(&mut self) {
        self.state = NodeState::Idle;
        self.next = TICKER_NULL;
        self.stop_at = None;
        self.reschedule = Reschedule::None;
    }

    /// Accumulate one period of remainder; returns the tick to carry.
    ///
    /// The current remainder stays within `(-range/2, range/2]`, so the
    /// expiry is rounded to the nearest tick.
    pub fn remainder_inc(&mut self, range: Option<u32>) -> u32 {
        let Some(range) = range else {
            return 0;
        };
        self.remainder_current = self.remainder_current.wrapping_add(self.remainder_periodic);
        if self.remainder_current < (1 << 31) && self.remainder_current > (range >> 1) {
            self.remainder_current = self.remainder_current.wrapping_sub(range);
            return 1;
        }
        0
    }

    /// Seed the current remainder for the first expiry; returns the whole
    /// ticks to add to the first expiry.
    pub fn remainder_seed(&mut self, remainder_first: u32, range: Option<u32>) -> u32 {
        let Some(range) = range else {
            self.remainder_current = 0;
            return 0;
        };
        let mut ticks = remainder_first / range;
        let mut remainder = remainder_first % range;
        if remainder > (range >> 1) {
            remainder = remainder.wrapping_sub(range);
            ticks += 1;
        }
        self.remainder_current = remainder;
        ticks
    }

    /// Rebase `ticks_to_expire` from `ticks_at_start` onto `ticks_current`
    /// and absorb as much pending negative drift as possible.
    ///
    /// An anchor in the past eats into `ticks_to_expire`; lateness beyond
    /// that is carried as negative drift.
    pub fn ticks_to_expire_prep(&mut self, ticks_current: u32, ticks_at_start: u32, mask: u32) {
        let mut ticks_to_expire = self.ticks_to_expire;
        let mut ticks_to_expire_minus = self.ticks_to_expire_minus;

        let ahead = diff_masked(ticks_at_start, ticks_current, mask);
        if ahead & msbit(mask) == 0 {
            ticks_to_expire = ticks_to_expire.wrapping_add(ahead);
        } else {
            let delta_current_start = diff_masked(ticks_current, ticks_at_start, mask);
            if ticks_to_expire > delta_current_start {
                ticks_to_expire -= delta_current_start;
            } else {
                ticks_to_expire_minus =
                    ticks_to_expire_minus.wrapping_add(delta_current_start - ticks_to_expire);
                ticks_to_expire = 0;
            }
        }

        if ticks_to_expire > ticks_to_expire_minus {
            ticks_to_expire -= ticks_to_expire_minus;
            ticks_to_expire_minus = 0;
        } else {
            ticks_to_expire_minus -= ticks_to_expire;
            ticks_to_expire = 0;
        }

        self.ticks_to_expire = ticks_to_expire;
        self.ticks_to_expire_minus = ticks_to_expire_minus;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: Option<u32> = Some(1_000_000);

    fn signed(v: u32) -> i32 {
        v as i32
    }

    #[test]
    fn test_remainder_disabled() {
        let mut node = Node::new();
        node.remainder_periodic = 900_000;
        for _ in 0..10 {
            assert_eq!(node.remainder_inc(None), 0);
        }
        assert_eq!(node.remainder_current, 0);
    }

    #[test]
    fn test_remainder_carry_sequence() {
        // 0.3 tick per period: rounded to the nearest tick
        let mut node = Node::new();
        node.remainder_periodic = 300_000;
        let mut carries = [0u32; 10];
        let mut currents = [0i32; 10];
        for i in 0..10 {
            carries[i] = node.remainder_inc(RANGE);
            currents[i] = signed(node.remainder_current);
        }
        assert_eq!(carries, [0, 1, 0, 0, 0, 1, 0, 0, 1, 0]);
        assert_eq!(
            currents,
            [
                300_000, -400_000, -100_000, 200_000, 500_000, -200_000, 100_000, 400_000,
                -300_000, 0
            ]
        );
    }

    #[test]
    fn test_remainder_no_long_run_drift() {
        // 1000 periods of 0.3 tick add exactly 300 ticks
        let mut node = Node::new();
        node.remainder_periodic = 300_000;
        let total: u32 = (0..1000).map(|_| node.remainder_inc(RANGE)).sum();
        assert_eq!(total, 300);
        assert_eq!(node.remainder_current, 0);
    }

    #[test]
    fn test_remainder_exactly_half_does_not_carry() {
        let mut node = Node::new();
        node.remainder_periodic = 500_000;
        assert_eq!(node.remainder_inc(RANGE), 0);
        assert_eq!(node.remainder_inc(RANGE), 1);
        assert_eq!(node.remainder_current, 0);
    }

    #[test]
    fn test_remainder_seed() {
        let mut node = Node::new();
        assert_eq!(node.remainder_seed(2_600_000, RANGE), 3);
        assert_eq!(signed(node.remainder_current), -400_000);

        assert_eq!(node.remainder_seed(400_000, RANGE), 0);
        assert_eq!(node.remainder_current, 400_000);

        assert_eq!(node.remainder_seed(400_000, None), 0);
        assert_eq!(node.remainder_current, 0);
    }

    #[test]
    fn test_prep_anchor_ahead() {
        let mut node = Node::new();
        node.ticks_to_expire = 100;
        node.ticks_to_expire_prep(1000, 1050, u32::MAX);
        assert_eq!(node.ticks_to_expire, 150);
        assert_eq!(node.ticks_to_expire_minus, 0);
    }

    #[test]
    fn test_prep_anchor_behind() {
        let mut node = Node::new();
        node.ticks_to_expire = 100;
        node.ticks_to_expire_prep(1040, 1000, u32::MAX);
        assert_eq!(node.ticks_to_expire, 60);
    }

    #[test]
    fn test_prep_late_becomes_negative_drift() {
        let mut node = Node::new();
        node.ticks_to_expire = 100;
        node.ticks_to_expire_prep(1130, 1000, u32::MAX);
        assert_eq!(node.ticks_to_expire, 0);
        assert_eq!(node.ticks_to_expire_minus, 30);
    }

    #[test]
    fn test_prep_absorbs_minus() {
        let mut node = Node::new();
        node.ticks_to_expire = 100;
        node.ticks_to_expire_minus = 30;
        node.ticks_to_expire_prep(1000, 1000, u32::MAX);
        assert_eq!(node.ticks_to_expire, 70);
        assert_eq!(node.ticks_to_expire_minus, 0);
    }

    #[test]
    fn test_prep_across_wrap() {
        let mut node = Node::new();
        node.ticks_to_expire = 0x10;
        node.ticks_to_expire_prep(0x00FF_FFF0, 0x8, 0x00FF_FFFF);
        assert_eq!(node.ticks_to_expire, 0x28);
    }
}
