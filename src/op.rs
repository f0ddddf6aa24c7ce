// SPDX-License-Identifier: Apache-2.0

//! User operations and the per-user rings that carry them to the job.
//!
//! Every user owns a ring carved out of one shared pool. A ring is indexed
//! by three cursors:
//!
//! ```text
//!   first ........ middle ........ last
//!   |  managed, not  |  not yet     |  free
//!   |  yet retired   |  managed     |
//! ```
//!
//! The job advances `middle` while applying updates and stops, inserts
//! started nodes from `first..middle`, and finally answers inquiries and
//! retires everything up to `middle`. A ring holds at most `count - 1`
//! operations.

use crate::error::{Status, TickerError};
use crate::node::TimeoutFn;
use crate::ticks::{TICKER_NULL, TICKER_NULL_LAZY, TICKER_NULL_SLOT};

/// Operation completion callback, invoked from the job.
pub type OpFn<'a> = &'a (dyn Fn(Status) + Sync);

/// Completion callback for [`Ticker::next_slot_get`](crate::Ticker::next_slot_get).
pub type SlotFn<'a> = &'a (dyn Fn(Status, SlotCursor) + Sync);

/// Iteration state for walking the active nodes that reserve a slot.
///
/// Start from [`SlotCursor::START`] and feed each returned cursor into the
/// next query. A cursor is restarted from the head of the list whenever its
/// `ticks_current` no longer matches the ticker's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCursor {
    pub ticker_id: u8,
    pub ticks_current: u32,
    /// Ticks from `ticks_current` to the expiry of `ticker_id`.
    pub ticks_to_expire: u32,
}

impl SlotCursor {
    pub const START: SlotCursor = SlotCursor {
        ticker_id: TICKER_NULL,
        ticks_current: 0,
        ticks_to_expire: 0,
    };

    /// True when the walk ran past the last active node.
    pub fn is_end(&self) -> bool {
        self.ticker_id == TICKER_NULL
    }
}

impl Default for SlotCursor {
    fn default() -> Self {
        Self::START
    }
}

/// Timing and callback of a node being started.
///
/// ```
/// # use bt_ticker::Start;
/// // Every 500 ticks, first expiry 100 ticks after tick 0, no latency
/// let start = Start::new(0, 100).periodic(500, 0);
/// assert_eq!(start.ticks_periodic, 500);
/// ```
#[derive(Clone, Copy)]
pub struct Start<'a> {
    /// Absolute tick the first expiry is measured from.
    pub ticks_anchor: u32,
    pub ticks_first: u32,
    /// 0 for a one-shot node.
    pub ticks_periodic: u32,
    pub remainder_periodic: u32,
    pub lazy: u16,
    pub ticks_slot: u32,
    pub timeout: Option<TimeoutFn<'a>>,
}

impl<'a> Start<'a> {
    /// One-shot node expiring `ticks_first` ticks after `ticks_anchor`.
    pub const fn new(ticks_anchor: u32, ticks_first: u32) -> Self {
        Start {
            ticks_anchor,
            ticks_first,
            ticks_periodic: 0,
            remainder_periodic: 0,
            lazy: TICKER_NULL_LAZY,
            ticks_slot: TICKER_NULL_SLOT,
            timeout: None,
        }
    }

    pub const fn periodic(mut self, ticks_periodic: u32, remainder_periodic: u32) -> Self {
        self.ticks_periodic = ticks_periodic;
        self.remainder_periodic = remainder_periodic;
        self
    }

    pub const fn lazy(mut self, lazy: u16) -> Self {
        self.lazy = lazy;
        self
    }

    pub const fn slot(mut self, ticks_slot: u32) -> Self {
        self.ticks_slot = ticks_slot;
        self
    }

    pub const fn on_timeout(mut self, timeout: TimeoutFn<'a>) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Extended start parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartExt {
    /// Window after each expiry within which the node may be moved when it
    /// loses a slot collision. 0 disables rescheduling.
    pub ticks_slot_window: u32,
    /// Node whose most recent expiry is reported to this node's callback,
    /// or [`TICKER_NULL`].
    pub expire_info_id: u8,
}

impl Default for StartExt {
    fn default() -> Self {
        StartExt {
            ticks_slot_window: 0,
            expire_info_id: TICKER_NULL,
        }
    }
}

/// Adjustments applied to a running node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Update {
    pub ticks_drift_plus: u32,
    pub ticks_drift_minus: u32,
    pub ticks_slot_plus: u32,
    pub ticks_slot_minus: u32,
    /// 0 leaves latency untouched, 1 clears it, `n > 1` sets it to `n - 1`.
    pub lazy: u16,
    pub force: u8,
}

impl Update {
    pub const fn new() -> Self {
        Update {
            ticks_drift_plus: 0,
            ticks_drift_minus: 0,
            ticks_slot_plus: 0,
            ticks_slot_minus: 0,
            lazy: 0,
            force: 0,
        }
    }

    pub const fn drift(mut self, plus: u32, minus: u32) -> Self {
        self.ticks_drift_plus = plus;
        self.ticks_drift_minus = minus;
        self
    }

    pub const fn slot(mut self, plus: u32, minus: u32) -> Self {
        self.ticks_slot_plus = plus;
        self.ticks_slot_minus = minus;
        self
    }

    pub const fn lazy(mut self, lazy: u16) -> Self {
        self.lazy = lazy;
        self
    }

    pub const fn force(mut self, force: u8) -> Self {
        self.force = force;
        self
    }
}

#[derive(Clone, Copy)]
pub(crate) struct StartOp<'a> {
    pub params: Start<'a>,
    pub remainder_first: u32,
    pub ext: StartExt,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UpdateOp {
    pub params: Update,
    pub must_expire: Option<bool>,
    pub expire_info_id: Option<u8>,
}

impl UpdateOp {
    /// An update that would not change anything.
    pub fn is_noop(&self) -> bool {
        self.params == Update::new() && self.must_expire.is_none() && self.expire_info_id.is_none()
    }
}

#[derive(Clone, Copy)]
pub(crate) enum OpKind<'a> {
    /// Completed, or never used.
    None,
    IdleGet,
    SlotGet { cursor: SlotCursor, done: SlotFn<'a> },
    PrioritySet(i8),
    Start(StartOp<'a>),
    Update(UpdateOp),
    Stop { ticks_at_stop: Option<u32> },
}

#[derive(Clone, Copy)]
pub(crate) struct UserOp<'a> {
    pub kind: OpKind<'a>,
    pub id: u8,
    pub op_fn: Option<OpFn<'a>>,
}

impl<'a> UserOp<'a> {
    pub const EMPTY: UserOp<'a> = UserOp {
        kind: OpKind::None,
        id: TICKER_NULL,
        op_fn: None,
    };

    pub fn new(kind: OpKind<'a>, id: u8, op_fn: Option<OpFn<'a>>) -> Self {
        UserOp { kind, id, op_fn }
    }

    /// Deliver the result to whoever submitted the operation.
    pub fn complete(&self, status: Status) {
        match self.kind {
            OpKind::SlotGet { cursor, done } => done(status, cursor),
            _ => {
                if let Some(op_fn) = self.op_fn {
                    op_fn(status);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UserRing {
    pub offset: usize,
    pub count: u8,
    pub first: u8,
    pub middle: u8,
    pub last: u8,
}

impl UserRing {
    const EMPTY: UserRing = UserRing {
        offset: 0,
        count: 0,
        first: 0,
        middle: 0,
        last: 0,
    };

    pub fn next(&self, idx: u8) -> u8 {
        let idx = idx.wrapping_add(1);
        if idx >= self.count {
            0
        } else {
            idx
        }
    }
}

pub(crate) struct OpPool<'a, const USERS: usize, const OPS: usize> {
    users: [UserRing; USERS],
    ops: [UserOp<'a>; OPS],
}

impl<'a, const USERS: usize, const OPS: usize> OpPool<'a, USERS, OPS> {
    pub const fn new() -> Self {
        OpPool {
            users: [UserRing::EMPTY; USERS],
            ops: [UserOp::EMPTY; OPS],
        }
    }

    /// Split the pool between users. The sizes must use up the pool exactly
    /// and leave at least one record.
    pub fn configure(&mut self, user_ops: &[u8; USERS]) -> Result<(), TickerError> {
        let total: usize = user_ops.iter().map(|&n| n as usize).sum();
        if USERS == 0 || total == 0 || total != OPS {
            return Err(TickerError::InvalidConfig);
        }
        self.reset();
        let mut offset = 0;
        for (ring, &count) in self.users.iter_mut().zip(user_ops.iter()) {
            *ring = UserRing {
                offset,
                count,
                ..UserRing::EMPTY
            };
            offset += count as usize;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.users = [UserRing::EMPTY; USERS];
        self.ops = [UserOp::EMPTY; OPS];
    }

    pub fn push(&mut self, user_id: u8, op: UserOp<'a>) -> Result<(), TickerError> {
        let ring = self
            .users
            .get_mut(user_id as usize)
            .ok_or(TickerError::InvalidUser(user_id))?;
        let last = ring.next(ring.last);
        if ring.count == 0 || last == ring.first {
            return Err(TickerError::Busy);
        }
        self.ops[ring.offset + ring.last as usize] = op;
        ring.last = last;
        Ok(())
    }

    pub fn ring(&self, user: usize) -> UserRing {
        self.users[user]
    }

    pub fn op(&self, user: usize, idx: u8) -> UserOp<'a> {
        let ring = &self.users[user];
        self.ops[ring.offset + idx as usize]
    }

    /// Mark the operation done and hand it back for completion.
    pub fn retire(&mut self, user: usize, idx: u8) -> UserOp<'a> {
        let offset = self.users[user].offset;
        let slot = &mut self.ops[offset + idx as usize];
        let op = *slot;
        slot.kind = OpKind::None;
        op
    }

    /// Take the next operation to manage, advancing `middle`.
    pub fn manage_next(&mut self, user: usize) -> Option<(u8, UserOp<'a>)> {
        let ring = &mut self.users[user];
        if ring.middle == ring.last {
            return None;
        }
        let idx = ring.middle;
        ring.middle = ring.next(idx);
        let op = self.ops[ring.offset + idx as usize];
        Some((idx, op))
    }

    /// Put `middle` back to `idx` so the operation is managed again later.
    pub fn manage_rewind(&mut self, user: usize, idx: u8) {
        self.users[user].middle = idx;
    }

    /// Take the oldest managed operation, advancing `first`.
    pub fn inquire_next(&mut self, user: usize) -> Option<(u8, UserOp<'a>)> {
        let ring = &mut self.users[user];
        if ring.first == ring.middle {
            return None;
        }
        let idx = ring.first;
        ring.first = ring.next(idx);
        let op = self.ops[ring.offset + idx as usize];
        Some((idx, op))
    }

    /// True if no user has an operation waiting.
    pub fn is_empty(&self) -> bool {
        self.users.iter().all(|ring| ring.first == ring.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: u8) -> UserOp<'static> {
        UserOp::new(OpKind::Stop { ticks_at_stop: None }, id, None)
    }

    #[test]
    fn test_configure_must_use_whole_pool() {
        let mut pool = OpPool::<2, 8>::new();
        assert_eq!(pool.configure(&[4, 3]), Err(TickerError::InvalidConfig));
        assert_eq!(pool.configure(&[4, 5]), Err(TickerError::InvalidConfig));
        assert_eq!(pool.configure(&[4, 4]), Ok(()));
        assert_eq!(pool.ring(1).offset, 4);
    }

    #[test]
    fn test_configure_rejects_empty_pool() {
        let mut pool = OpPool::<2, 0>::new();
        assert_eq!(pool.configure(&[0, 0]), Err(TickerError::InvalidConfig));
    }

    #[test]
    fn test_ring_keeps_one_slot_free() {
        let mut pool = OpPool::<2, 8>::new();
        pool.configure(&[4, 4]).unwrap();
        for id in 0..3 {
            assert_eq!(pool.push(0, stop(id)), Ok(()));
        }
        assert_eq!(pool.push(0, stop(3)), Err(TickerError::Busy));
        // Other user is unaffected
        assert_eq!(pool.push(1, stop(3)), Ok(()));
        assert_eq!(pool.push(2, stop(3)), Err(TickerError::InvalidUser(2)));
    }

    #[test]
    fn test_zero_sized_ring_is_always_busy() {
        let mut pool = OpPool::<2, 4>::new();
        pool.configure(&[0, 4]).unwrap();
        assert_eq!(pool.push(0, stop(0)), Err(TickerError::Busy));
        assert_eq!(pool.push(1, stop(0)), Ok(()));
    }

    #[test]
    fn test_manage_then_inquire_in_order() {
        let mut pool = OpPool::<1, 4>::new();
        pool.configure(&[4]).unwrap();
        pool.push(0, stop(7)).unwrap();
        pool.push(0, stop(8)).unwrap();

        // Nothing is retired before it is managed
        assert!(pool.inquire_next(0).is_none());

        let (idx, op) = pool.manage_next(0).unwrap();
        assert_eq!((idx, op.id), (0, 7));
        let (idx, op) = pool.manage_next(0).unwrap();
        assert_eq!((idx, op.id), (1, 8));
        pool.manage_rewind(0, 1);

        let (idx, _) = pool.inquire_next(0).unwrap();
        assert_eq!(idx, 0);
        assert!(pool.inquire_next(0).is_none());
        assert!(!pool.is_empty());

        let (idx, _) = pool.manage_next(0).unwrap();
        assert_eq!(idx, 1);
        assert!(pool.manage_next(0).is_none());
        pool.inquire_next(0).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_ring_wraps() {
        let mut pool = OpPool::<1, 3>::new();
        pool.configure(&[3]).unwrap();
        for round in 0..5u8 {
            pool.push(0, stop(round)).unwrap();
            pool.push(0, stop(round + 100)).unwrap();
            assert_eq!(pool.push(0, stop(0)), Err(TickerError::Busy));
            assert_eq!(pool.manage_next(0).unwrap().1.id, round);
            assert_eq!(pool.manage_next(0).unwrap().1.id, round + 100);
            assert!(pool.inquire_next(0).is_some());
            assert!(pool.inquire_next(0).is_some());
            assert!(pool.is_empty());
        }
    }

    #[test]
    fn test_retire_clears_kind() {
        let mut pool = OpPool::<1, 2>::new();
        pool.configure(&[2]).unwrap();
        pool.push(0, UserOp::new(OpKind::IdleGet, TICKER_NULL, None))
            .unwrap();
        let op = pool.retire(0, 0);
        assert!(matches!(op.kind, OpKind::IdleGet));
        assert!(matches!(pool.op(0, 0).kind, OpKind::None));
    }

    #[test]
    fn test_update_noop() {
        let op = UpdateOp {
            params: Update::new(),
            must_expire: None,
            expire_info_id: None,
        };
        assert!(op.is_noop());
        let op = UpdateOp {
            params: Update::new().force(1),
            ..op
        };
        assert!(!op.is_noop());
        let op = UpdateOp {
            params: Update::new(),
            must_expire: Some(false),
            expire_info_id: None,
        };
        assert!(!op.is_noop());
    }

    #[test]
    fn test_complete_calls_back() {
        use core::sync::atomic::{AtomicU32, Ordering};
        let seen = AtomicU32::new(u32::MAX);
        let op_fn = |status: Status| seen.store(status as u32, Ordering::SeqCst);
        let op = UserOp::new(OpKind::IdleGet, TICKER_NULL, Some(&op_fn));
        op.complete(Status::Failure);
        assert_eq!(seen.load(Ordering::SeqCst), Status::Failure as u32);
    }
}
