// SPDX-License-Identifier: Apache-2.0

//! Lower half: apply user operations, re-arm what the worker consumed and
//! program the next compare.

use core::cell::RefMut;
use core::sync::atomic::Ordering;

use critical_section::CriticalSection;

use super::list::Core;
use super::Ticker;
use crate::counter::{CallId, Counter, Platform};
use crate::error::Status;
use crate::node::{NodeState, Reschedule};
use crate::op::{OpKind, OpPool, StartOp, UpdateOp, UserOp};
use crate::ticks::{diff_masked, is_before, TICKER_LAZY_MUST_EXPIRE, TICKER_NULL};

const COMPARE_ATTEMPTS: u32 = 10;

impl<'a, C, P, const NODES: usize, const USERS: usize, const OPS: usize>
    Ticker<'a, C, P, NODES, USERS, OPS>
where
    C: Counter,
    P: Platform,
{
    /// Run one job pass over a borrowed node table.
    ///
    /// Returns true if an operation had to wait for a later pass.
    pub(super) fn job_run(&self, cs: CriticalSection<'_>, core: &mut Core<'a, NODES>) -> bool {
        if core.head == TICKER_NULL && !core.counter_running && !core.has_elapsed() {
            // Nothing is relative to the old tick any more
            core.ticks_current = self.counter.now() & C::MASK;
        }

        let ticks_previous = core.ticks_current;
        let elapsed = core.pop_elapsed();
        let ticks_elapsed = elapsed.unwrap_or(0);
        core.ticks_current = ticks_previous.wrapping_add(ticks_elapsed) & C::MASK;

        let old_head = core.head;
        let mut compare_update = false;
        let mut insert_head = TICKER_NULL;

        let mut pending = self.list_manage(cs, core, ticks_elapsed, &mut insert_head);
        compare_update |= core.head != old_head;

        if elapsed.is_some() {
            core.worker_bh(
                ticks_previous,
                ticks_elapsed,
                &mut insert_head,
                C::MASK,
                C::REMAINDER_RANGE,
            );
            compare_update |= core.head != old_head;
        }

        self.list_insert(cs, core, insert_head);
        compare_update |= core.head != old_head;

        if pending {
            // Operations on nodes the bottom half has just re-armed
            let mut insert_head = TICKER_NULL;
            pending = self.list_manage(cs, core, 0, &mut insert_head);
            self.list_insert(cs, core, insert_head);
            compare_update |= core.head != old_head;
        }

        core.reschedule_parked(self.counter.now(), C::MASK, C::CMP_OFFSET_MIN, C::REMAINDER_RANGE);
        compare_update |= core.head != old_head;

        if !pending {
            self.list_inquire(cs, core);
        }

        log::trace!(
            "job elapsed={} head={} pending={}",
            ticks_elapsed,
            core.head,
            pending
        );

        if compare_update {
            self.compare_update(core);
        }

        pending
    }

    fn pool<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, OpPool<'a, USERS, OPS>> {
        self.ops.borrow(cs).borrow_mut()
    }

    fn finish(&self, cs: CriticalSection<'_>, user: usize, idx: u8, status: Status) {
        let op = self.pool(cs).retire(user, idx);
        if status != Status::Success {
            log::debug!("op on id={} completed with {:?}", op.id, status);
        }
        op.complete(status);
    }

    /// Apply updates and stops, highest user first.
    fn list_manage(
        &self,
        cs: CriticalSection<'_>,
        core: &mut Core<'a, NODES>,
        ticks_elapsed: u32,
        insert_head: &mut u8,
    ) -> bool {
        let mut pending = false;
        for user in (0..USERS).rev() {
            loop {
                let next = self.pool(cs).manage_next(user);
                let Some((idx, op)) = next else {
                    break;
                };
                if !matches!(op.kind, OpKind::Update(_) | OpKind::Stop { .. }) {
                    continue;
                }

                let now = self.counter.now() & C::MASK;
                match core.manage(&op, ticks_elapsed, now, insert_head, C::MASK) {
                    Some(status) => self.finish(cs, user, idx, status),
                    None => {
                        self.pool(cs).manage_rewind(user, idx);
                        pending = true;
                        break;
                    }
                }
            }
        }
        pending
    }

    /// Insert re-armed nodes, then started ones.
    fn list_insert(&self, cs: CriticalSection<'_>, core: &mut Core<'a, NODES>, mut insert_head: u8) {
        while insert_head != TICKER_NULL {
            let id = insert_head;
            insert_head = core.node(id).next;
            core.insert(id);
        }

        for user in (0..USERS).rev() {
            let ring = self.pool(cs).ring(user);
            let mut idx = ring.first;
            while idx != ring.middle {
                let current = idx;
                idx = ring.next(idx);
                let op = self.pool(cs).op(user, current);
                if let OpKind::Start(start) = op.kind {
                    let status = core.start(op.id, &start, C::MASK, C::REMAINDER_RANGE);
                    self.finish(cs, user, current, status);
                }
            }
        }
    }

    /// Answer inquiries and retire everything managed so far.
    fn list_inquire(&self, cs: CriticalSection<'_>, core: &mut Core<'a, NODES>) {
        for user in (0..USERS).rev() {
            loop {
                let next = self.pool(cs).inquire_next(user);
                let Some((_, op)) = next else {
                    break;
                };
                match op.kind {
                    OpKind::SlotGet { cursor, done } => done(Status::Success, core.next_slot(cursor)),
                    OpKind::IdleGet => op.complete(Status::Success),
                    OpKind::PrioritySet(priority) => {
                        let status = if (op.id as usize) < NODES {
                            core.node_mut(op.id).priority = priority;
                            Status::Success
                        } else {
                            Status::Failure
                        };
                        op.complete(status);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Arm the trigger for the head of the list, making sure the compare
    /// lands ahead of the running counter.
    fn compare_update(&self, core: &mut Core<'a, NODES>) {
        if core.head == TICKER_NULL {
            if core.counter_running {
                self.counter.stop();
                core.counter_running = false;
            }
            core.ticks_slot_previous = 0;
            core.ticker_id_slot_previous = TICKER_NULL;
            return;
        }

        if !core.counter_running {
            self.counter.start();
            core.counter_running = true;
        }

        let ticks_to_expire = core.node(core.head).ticks_to_expire;
        for _ in 0..COMPARE_ATTEMPTS {
            let ctr = self.counter.now() & C::MASK;
            let ticks_min = diff_masked(ctr, core.ticks_current, C::MASK)
                .wrapping_add(C::CMP_OFFSET_MIN)
                .wrapping_add(C::SET_LATENCY);
            let cc = core.ticks_current.wrapping_add(ticks_min.max(ticks_to_expire)) & C::MASK;
            self.platform.arm_trigger(cc);

            let ctr_post = self.counter.now() & C::MASK;
            if diff_masked(ctr_post, ctr, C::MASK).wrapping_add(C::CMP_OFFSET_MIN)
                <= diff_masked(cc, ctr, C::MASK)
            {
                return;
            }
        }
        log::warn!("compare could not be armed ahead of the counter");
    }

    /// Run the job unless the worker is pending, then chain whatever is
    /// still outstanding.
    pub(super) fn job_entry(&self) {
        if self.worker_trigger.load(Ordering::Acquire) {
            // The worker schedules the job once it is done
            return;
        }

        let pending = critical_section::with(|cs| {
            let Ok(mut state) = self.core.borrow(cs).try_borrow_mut() else {
                self.job_again.store(true, Ordering::Release);
                return None;
            };
            let pending = self.job_run(cs, &mut state);
            // Callbacks may have queued more work after the rings were read
            Some(pending || !self.pool(cs).is_empty())
        });
        let Some(pending) = pending else {
            return;
        };

        if self.worker_trigger.load(Ordering::Acquire) {
            self.platform.schedule(CallId::Job, CallId::Worker, true);
        }
        if pending || self.job_again.swap(false, Ordering::AcqRel) {
            self.platform.schedule(CallId::Job, CallId::Job, true);
        }
    }
}

impl<'a, const NODES: usize> Core<'a, NODES> {
    /// Apply an update or stop. `None` if the node is between the worker
    /// and the bottom half and the operation has to wait.
    pub fn manage(
        &mut self,
        op: &UserOp<'a>,
        ticks_elapsed: u32,
        ticks_now: u32,
        insert_head: &mut u8,
        mask: u32,
    ) -> Option<Status> {
        if op.id as usize >= NODES {
            return Some(Status::Failure);
        }
        let state = self.node(op.id).state;
        if state == NodeState::Idle {
            return Some(Status::Failure);
        }
        if let OpKind::Update(update) = op.kind {
            if update.is_noop() {
                return Some(Status::Failure);
            }
        }
        if state != NodeState::Scheduled {
            return None;
        }

        match op.kind {
            OpKind::Update(update) => {
                self.node_update(op.id, &update, ticks_elapsed, ticks_now, mask);
                let node = self.node_mut(op.id);
                node.state = NodeState::Requeued;
                node.next = *insert_head;
                *insert_head = op.id;
            }
            OpKind::Stop { ticks_at_stop } => {
                self.node_stop(op.id, ticks_at_stop, ticks_elapsed, ticks_now, mask);
            }
            _ => return Some(Status::Failure),
        }
        Some(Status::Success)
    }

    fn node_update(&mut self, id: u8, update: &UpdateOp, ticks_elapsed: u32, ticks_now: u32, mask: u32) {
        let ticks_current = self.ticks_current;
        let mut ticks_to_expire = self.dequeue(id);
        let node = self.node_mut(id);
        let params = &update.params;

        // Re-express the expiry relative to now
        let elapsed = ticks_elapsed.wrapping_add(diff_masked(ticks_now, ticks_current, mask));
        if ticks_to_expire > elapsed {
            ticks_to_expire -= elapsed;
        } else {
            node.ticks_to_expire_minus = node
                .ticks_to_expire_minus
                .wrapping_add(elapsed - ticks_to_expire);
            ticks_to_expire = 0;
        }

        if node.ticks_periodic != 0 && params.lazy != 0 {
            node.lazy_periodic = params.lazy - 1;
        }

        node.ticks_to_expire = ticks_to_expire.wrapping_add(params.ticks_drift_plus);
        node.ticks_to_expire_minus = node
            .ticks_to_expire_minus
            .wrapping_add(params.ticks_drift_minus);
        node.ticks_to_expire_prep(ticks_current, ticks_now, mask);
        node.ticks_drift = node
            .ticks_drift
            .wrapping_add(params.ticks_drift_plus)
            .wrapping_sub(params.ticks_drift_minus);

        node.ticks_slot = node
            .ticks_slot
            .saturating_add(params.ticks_slot_plus)
            .saturating_sub(params.ticks_slot_minus);

        if params.force != 0 {
            node.force = params.force;
        }
        if let Some(must_expire) = update.must_expire {
            node.must_expire = must_expire;
        }
        if let Some(expire_info_id) = update.expire_info_id {
            node.expire_info_id = expire_info_id;
        }
    }

    fn node_stop(&mut self, id: u8, ticks_at_stop: Option<u32>, ticks_elapsed: u32, ticks_now: u32, mask: u32) {
        if let Some(ticks_at_stop) = ticks_at_stop {
            self.release_slot(id, ticks_at_stop, ticks_elapsed, mask);
            if let Some(offset) = self.offset_of(id) {
                // The list is still relative to the tick before this job
                let ticks_expire = self
                    .ticks_current
                    .wrapping_add(offset)
                    .wrapping_sub(ticks_elapsed)
                    & mask;
                if is_before(ticks_expire, ticks_at_stop, mask) {
                    self.node_mut(id).stop_at = Some(ticks_at_stop);
                    return;
                }
            }
        } else {
            self.release_slot(id, ticks_now, ticks_elapsed, mask);
        }

        self.dequeue(id);
        self.node_mut(id).release();
    }

    /// Shorten the running slot of node `id` so it ends at `ticks_at_stop`.
    fn release_slot(&mut self, id: u8, ticks_at_stop: u32, ticks_elapsed: u32, mask: u32) {
        if self.ticker_id_slot_previous != id {
            return;
        }
        // ticks_slot_previous counts from the tick before this job
        let ticks_used = if is_before(ticks_at_stop, self.ticks_current, mask) {
            ticks_elapsed.saturating_sub(diff_masked(self.ticks_current, ticks_at_stop, mask))
        } else {
            ticks_elapsed.wrapping_add(diff_masked(ticks_at_stop, self.ticks_current, mask))
        };
        if self.ticks_slot_previous > ticks_used {
            self.ticks_slot_previous = ticks_used;
        }
        if self.ticks_slot_previous == 0 {
            self.ticker_id_slot_previous = TICKER_NULL;
        }
    }

    /// Unlink everything the worker consumed. Periodic nodes are re-armed
    /// onto `insert_head`, one-shots go idle.
    pub fn worker_bh(
        &mut self,
        ticks_previous: u32,
        mut ticks_elapsed: u32,
        insert_head: &mut u8,
        mask: u32,
        remainder_range: Option<u32>,
    ) {
        let ticks_current = self.ticks_current;
        let mut ticks_expired = 0u32;

        while self.head != TICKER_NULL {
            let id = self.head;
            let ticks_to_expire = self.node(id).ticks_to_expire;
            if ticks_elapsed < ticks_to_expire {
                self.node_mut(id).ticks_to_expire -= ticks_elapsed;
                break;
            }
            ticks_elapsed -= ticks_to_expire;
            ticks_expired = ticks_expired.wrapping_add(ticks_to_expire);

            if self.ticks_slot_previous > ticks_to_expire {
                self.ticks_slot_previous -= ticks_to_expire;
            } else {
                self.ticker_id_slot_previous = TICKER_NULL;
                self.ticks_slot_previous = 0;
            }
            let node = self.node(id);
            let fired = node.state == NodeState::Expired && node.lazy_current == 0;
            let ticks_slot = node.ticks_slot;
            if fired && ticks_slot != 0 {
                self.ticker_id_slot_previous = id;
                self.ticks_slot_previous = ticks_slot;
            }

            let ticks_at_expire = ticks_previous.wrapping_add(ticks_expired) & mask;
            self.head = self.node(id).next;
            let node = self.node_mut(id);
            node.ticks_to_expire = 0;
            node.next = TICKER_NULL;

            if node
                .stop_at
                .is_some_and(|ticks_at_stop| !is_before(ticks_at_expire, ticks_at_stop, mask))
            {
                node.release();
                continue;
            }

            if node.reschedule == Reschedule::Pending {
                node.state = NodeState::Requeued;
                node.reschedule = Reschedule::Parked {
                    anchor: ticks_at_expire,
                };
                continue;
            }

            if node.ticks_periodic == 0 {
                node.release();
                continue;
            }

            node.ticks_to_expire = node
                .ticks_periodic
                .wrapping_add(node.remainder_inc(remainder_range));
            if let Reschedule::Placed { displacement } = node.reschedule {
                // Keep the period aligned with the skipped anchor
                node.ticks_to_expire_minus = node.ticks_to_expire_minus.wrapping_add(displacement);
                node.reschedule = Reschedule::None;
            }
            node.ticks_to_expire_prep(ticks_current, ticks_at_expire, mask);
            node.state = NodeState::Requeued;
            node.next = *insert_head;
            *insert_head = id;
        }
    }

    pub fn insert(&mut self, id: u8) {
        self.node_mut(id).next = TICKER_NULL;
        self.enqueue(id);
        self.node_mut(id).state = NodeState::Scheduled;
    }

    pub fn start(&mut self, id: u8, start: &StartOp<'a>, mask: u32, remainder_range: Option<u32>) -> Status {
        if id as usize >= NODES || self.node(id).state != NodeState::Idle {
            return Status::Failure;
        }

        let ticks_current = self.ticks_current;
        let params = &start.params;
        let node = self.node_mut(id);
        node.must_expire = params.lazy == TICKER_LAZY_MUST_EXPIRE;
        node.lazy_periodic = if node.must_expire || params.ticks_periodic == 0 {
            0
        } else {
            params.lazy
        };
        node.ticks_periodic = params.ticks_periodic;
        node.remainder_periodic = params.remainder_periodic;
        node.ticks_slot = params.ticks_slot;
        node.ticks_slot_window = start.ext.ticks_slot_window;
        node.timeout = params.timeout;
        node.expire_info_id = start.ext.expire_info_id;
        node.last_expiry = None;
        node.stop_at = None;
        node.reschedule = Reschedule::None;
        node.ticks_drift = 0;

        let ticks_extra = node.remainder_seed(start.remainder_first, remainder_range);
        node.ticks_to_expire = params.ticks_first.wrapping_add(ticks_extra);
        node.ticks_to_expire_minus = 0;
        node.ticks_to_expire_prep(ticks_current, params.ticks_anchor, mask);
        node.lazy_current = 0;
        node.force = 1;

        self.insert(id);
        Status::Success
    }

    /// Place nodes that lost a collision into the first free gap of their
    /// window, or count the occurrence as skipped.
    pub fn reschedule_parked(
        &mut self,
        ticks_now: u32,
        mask: u32,
        cmp_offset_min: u32,
        remainder_range: Option<u32>,
    ) {
        for id in 0..NODES as u8 {
            if let Reschedule::Parked { anchor } = self.node(id).reschedule {
                if !self.place_in_window(id, anchor, ticks_now, mask, cmp_offset_min) {
                    self.skip_parked(id, anchor, mask, remainder_range);
                }
            }
        }
    }

    fn place_in_window(&mut self, id: u8, anchor: u32, ticks_now: u32, mask: u32, cmp_offset_min: u32) -> bool {
        let node = self.node(id);
        let ticks_slot = node.ticks_slot;
        let ticks_late = diff_masked(self.ticks_current, anchor, mask);
        let Some(window_end) = node.ticks_slot_window.checked_sub(ticks_late) else {
            return false;
        };

        let mut ticks_gap = diff_masked(ticks_now, self.ticks_current, mask)
            .saturating_add(cmp_offset_min)
            .max(self.ticks_slot_previous);
        let mut acc_ticks_to_expire = 0u32;
        for other in self.ids() {
            let other = self.node(other);
            acc_ticks_to_expire = acc_ticks_to_expire.wrapping_add(other.ticks_to_expire);
            if other.ticks_slot == 0 {
                continue;
            }
            if ticks_gap.saturating_add(ticks_slot) <= acc_ticks_to_expire {
                break;
            }
            ticks_gap = ticks_gap.max(acc_ticks_to_expire.saturating_add(other.ticks_slot));
        }

        if ticks_gap.saturating_add(ticks_slot) > window_end {
            return false;
        }

        log::trace!("reschedule id={} +{}", id, ticks_late + ticks_gap);
        let node = self.node_mut(id);
        node.ticks_to_expire = ticks_gap;
        node.reschedule = Reschedule::Placed {
            displacement: ticks_late.wrapping_add(ticks_gap),
        };
        self.insert(id);
        true
    }

    fn skip_parked(&mut self, id: u8, anchor: u32, mask: u32, remainder_range: Option<u32>) {
        let ticks_current = self.ticks_current;
        let node = self.node_mut(id);
        node.lazy_current = node.lazy_current.saturating_add(1);
        node.reschedule = Reschedule::None;
        if node.ticks_periodic == 0 {
            node.release();
            return;
        }
        node.ticks_to_expire = node
            .ticks_periodic
            .wrapping_add(node.remainder_inc(remainder_range));
        node.ticks_to_expire_prep(ticks_current, anchor, mask);
        self.insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Start, StartExt, Update};

    fn start_op(first: u32, periodic: u32) -> StartOp<'static> {
        StartOp {
            params: Start::new(0, first).periodic(periodic, 0),
            remainder_first: 0,
            ext: StartExt::default(),
        }
    }

    fn update_op(id: u8, update: Update) -> UserOp<'static> {
        UserOp::new(
            OpKind::Update(UpdateOp {
                params: update,
                must_expire: None,
                expire_info_id: None,
            }),
            id,
            None,
        )
    }

    #[test]
    fn test_start_rejects_active_and_out_of_range() {
        let mut core: Core<'static, 2> = Core::new();
        assert_eq!(core.start(0, &start_op(100, 0), u32::MAX, None), Status::Success);
        assert_eq!(core.start(0, &start_op(100, 0), u32::MAX, None), Status::Failure);
        assert_eq!(core.start(2, &start_op(100, 0), u32::MAX, None), Status::Failure);
    }

    #[test]
    fn test_bh_rearms_periodic_and_releases_one_shot() {
        let mut core: Core<'static, 2> = Core::new();
        core.start(0, &start_op(100, 500), u32::MAX, None);
        core.start(1, &start_op(100, 0), u32::MAX, None);
        core.node_mut(0).state = NodeState::Expired;
        core.node_mut(1).state = NodeState::Expired;

        let mut insert_head = TICKER_NULL;
        core.ticks_current = 100;
        core.worker_bh(0, 100, &mut insert_head, u32::MAX, None);
        assert_eq!(insert_head, 0);
        assert_eq!(core.node(0).ticks_to_expire, 500);
        assert_eq!(core.node(1).state, NodeState::Idle);
        assert_eq!(core.head, TICKER_NULL);
    }

    #[test]
    fn test_bh_remainder_carry() {
        let mut core: Core<'static, 1> = Core::new();
        let mut start = start_op(100, 500);
        start.params.remainder_periodic = 600_000;
        core.start(0, &start, u32::MAX, Some(1_000_000));
        core.node_mut(0).state = NodeState::Expired;

        let mut insert_head = TICKER_NULL;
        core.ticks_current = 100;
        core.worker_bh(0, 100, &mut insert_head, u32::MAX, Some(1_000_000));
        assert_eq!(core.node(0).ticks_to_expire, 501);
    }

    #[test]
    fn test_update_moves_expiry_and_keeps_id() {
        let mut core: Core<'static, 2> = Core::new();
        core.start(0, &start_op(100, 500), u32::MAX, None);

        let mut insert_head = TICKER_NULL;
        let op = update_op(0, Update::new().drift(20, 5));
        assert_eq!(core.manage(&op, 0, 0, &mut insert_head, u32::MAX), Some(Status::Success));
        assert_eq!(insert_head, 0);
        core.insert(insert_head);
        assert_eq!(core.offset_of(0), Some(115));
        assert_eq!(core.node(0).ticks_drift, 15);
    }

    #[test]
    fn test_update_noop_and_idle_fail() {
        let mut core: Core<'static, 2> = Core::new();
        let mut insert_head = TICKER_NULL;
        let op = update_op(0, Update::new().force(1));
        assert_eq!(core.manage(&op, 0, 0, &mut insert_head, u32::MAX), Some(Status::Failure));

        core.start(0, &start_op(100, 500), u32::MAX, None);
        let op = update_op(0, Update::new());
        assert_eq!(core.manage(&op, 0, 0, &mut insert_head, u32::MAX), Some(Status::Failure));
    }

    #[test]
    fn test_update_on_expired_node_defers() {
        let mut core: Core<'static, 2> = Core::new();
        core.start(0, &start_op(100, 500), u32::MAX, None);
        core.node_mut(0).state = NodeState::Expired;
        let mut insert_head = TICKER_NULL;
        let op = update_op(0, Update::new().lazy(1));
        assert_eq!(core.manage(&op, 0, 0, &mut insert_head, u32::MAX), None);
    }

    #[test]
    fn test_update_slot_saturates() {
        let mut core: Core<'static, 1> = Core::new();
        let mut start = start_op(100, 500);
        start.params.ticks_slot = 10;
        core.start(0, &start, u32::MAX, None);
        let mut insert_head = TICKER_NULL;
        let op = update_op(0, Update::new().slot(5, 40));
        core.manage(&op, 0, 0, &mut insert_head, u32::MAX);
        assert_eq!(core.node(0).ticks_slot, 0);
    }

    #[test]
    fn test_stop_abs_defers_until_expiry_at_or_after() {
        let mut core: Core<'static, 1> = Core::new();
        core.start(0, &start_op(100, 500), u32::MAX, None);
        let mut insert_head = TICKER_NULL;
        let op = UserOp::new(OpKind::Stop { ticks_at_stop: Some(300) }, 0, None);
        assert_eq!(core.manage(&op, 0, 0, &mut insert_head, u32::MAX), Some(Status::Success));
        assert_eq!(core.node(0).stop_at, Some(300));
        assert_eq!(core.node(0).state, NodeState::Scheduled);

        let op = UserOp::new(OpKind::Stop { ticks_at_stop: Some(50) }, 0, None);
        core.node_mut(0).stop_at = None;
        core.manage(&op, 0, 0, &mut insert_head, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Idle);
        assert_eq!(core.head, TICKER_NULL);
    }

    #[test]
    fn test_stop_releases_running_slot() {
        let mut core: Core<'static, 1> = Core::new();
        core.start(0, &start_op(100, 500), u32::MAX, None);
        core.ticker_id_slot_previous = 0;
        core.ticks_slot_previous = 80;
        let mut insert_head = TICKER_NULL;
        let op = UserOp::new(OpKind::Stop { ticks_at_stop: None }, 0, None);
        core.manage(&op, 10, 30, &mut insert_head, u32::MAX);
        assert_eq!(core.ticks_slot_previous, 40);
        assert_eq!(core.ticker_id_slot_previous, 0);
    }

    #[test]
    fn test_parked_node_moves_into_gap() {
        let mut core: Core<'static, 3> = Core::new();
        // Node 1 holds [0, 50), node 2 holds [200, 250)
        for (id, first) in [(1u8, 0u32), (2, 200)] {
            let mut start = start_op(first, 1000);
            start.params.ticks_slot = 50;
            core.start(id, &start, u32::MAX, None);
        }
        let mut start = start_op(0, 1000);
        start.params.ticks_slot = 100;
        start.ext.ticks_slot_window = 400;
        core.node_mut(0).ticks_slot = 100;
        core.start(0, &start, u32::MAX, None);
        core.dequeue(0);
        core.node_mut(0).state = NodeState::Requeued;
        core.node_mut(0).reschedule = Reschedule::Parked { anchor: 0 };

        core.reschedule_parked(0, u32::MAX, 1, None);
        assert_eq!(core.offset_of(0), Some(50));
        assert_eq!(
            core.node(0).reschedule,
            Reschedule::Placed { displacement: 50 }
        );
    }

    #[test]
    fn test_parked_node_without_gap_skips() {
        let mut core: Core<'static, 2> = Core::new();
        let mut start = start_op(10, 1000);
        start.params.ticks_slot = 500;
        core.start(1, &start, u32::MAX, None);

        let mut start = start_op(0, 1000);
        start.params.ticks_slot = 100;
        start.ext.ticks_slot_window = 300;
        core.start(0, &start, u32::MAX, None);
        core.dequeue(0);
        core.node_mut(0).state = NodeState::Requeued;
        core.node_mut(0).reschedule = Reschedule::Parked { anchor: 0 };

        core.reschedule_parked(0, u32::MAX, 1, None);
        assert_eq!(core.node(0).lazy_current, 1);
        assert_eq!(core.offset_of(0), Some(1000));
        assert_eq!(core.node(0).reschedule, Reschedule::None);
    }
}
